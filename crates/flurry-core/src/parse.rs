//! Parsing helpers: peer address extraction from SDP, relay URL acceptance,
//! and transport address construction.

use crate::error::{FlurryError, FlurryResult};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use url::Url;

/// Extract the first routable address a peer advertises in its session
/// description, looking at connection (`c=`) lines and ICE candidates.
///
/// Private, loopback, link-local, unspecified and carrier-grade NAT
/// addresses are skipped, as are mDNS (`.local`) candidate hostnames.
pub fn ip_from_sdp(sdp: &str) -> Option<IpAddr> {
    sdp.lines()
        .filter_map(|line| {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("c=IN ") {
                // c=IN IP4 203.0.113.7[/ttl[/count]]
                let addr = rest.split_whitespace().nth(1)?;
                addr.split('/').next()?.parse::<IpAddr>().ok()
            } else if let Some(rest) = line.strip_prefix("a=candidate:") {
                // foundation component transport priority address port typ ...
                rest.split_whitespace().nth(4)?.parse::<IpAddr>().ok()
            } else {
                None
            }
        })
        .find(is_routable)
}

/// Whether an address is publicly routable for the purpose of annotating
/// relay connections.
pub fn is_routable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_routable_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_routable_v4(&v4),
            None => is_routable_v6(v6),
        },
    }
}

fn is_routable_v4(ip: &Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    let cgn = a == 100 && (64..128).contains(&b);
    !(ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_broadcast()
        || ip.is_multicast()
        || cgn)
}

fn is_routable_v6(ip: &Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    let unique_local = (first & 0xfe00) == 0xfc00;
    let link_local = (first & 0xffc0) == 0xfe80;
    !(ip.is_unspecified() || ip.is_loopback() || ip.is_multicast() || unique_local || link_local)
}

/// Check a hostname against an allowed relay pattern.
///
/// A leading `^` demands an exact match; otherwise the host must end with
/// the pattern. A trailing `$` is accepted and ignored since matching is
/// already anchored at the end.
pub fn check_relay_pattern(pattern: &str, host: &str) -> bool {
    let (exact, pattern) = match pattern.strip_prefix('^') {
        Some(rest) => (true, rest),
        None => (false, pattern),
    };
    let pattern = pattern.strip_suffix('$').unwrap_or(pattern).to_ascii_lowercase();
    let host = host.to_ascii_lowercase();

    if pattern.is_empty() {
        return false;
    }
    if exact {
        host == pattern
    } else {
        host.ends_with(&pattern)
    }
}

/// Validate a broker-supplied relay URL: it must use `wss` and its host must
/// satisfy the allowed pattern.
pub fn parse_relay_url(raw: &str, pattern: &str) -> FlurryResult<Url> {
    let url = Url::parse(raw)?;
    if url.scheme() != "wss" {
        return Err(FlurryError::RelayNotAllowed(format!(
            "relay URL must use wss, got {}",
            url.scheme()
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| FlurryError::RelayNotAllowed(format!("relay URL has no host: {raw}")))?;
    if !check_relay_pattern(pattern, host) {
        return Err(FlurryError::RelayNotAllowed(format!(
            "host {host} does not match pattern {pattern}"
        )));
    }
    Ok(url)
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" | "ws" => Some(80),
        "https" | "wss" => Some(443),
        _ => None,
    }
}

/// Build a transport address from parts.
///
/// IPv6 literals are bracketed, the port is dropped when it is the scheme's
/// default, and query parameters are form-encoded in the given order.
pub fn build_url(
    scheme: &str,
    host: &str,
    port: Option<u16>,
    path: &str,
    params: &[(&str, &str)],
) -> String {
    let mut out = format!("{scheme}://");

    if host.contains(':') && !host.starts_with('[') {
        out.push('[');
        out.push_str(host);
        out.push(']');
    } else {
        out.push_str(host);
    }

    if let Some(port) = port {
        if default_port(scheme) != Some(port) {
            out.push(':');
            out.push_str(&port.to_string());
        }
    }

    if !path.starts_with('/') {
        out.push('/');
    }
    out.push_str(path);

    if !params.is_empty() {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params.iter())
            .finish();
        out.push('?');
        out.push_str(&query);
    }

    out
}

/// Normalise a configured broker URL: assume `https://` (plain `http://` for
/// `localhost`) when no scheme is given, and ensure a trailing slash.
pub fn normalize_broker_url(raw: &str) -> String {
    let raw = raw.trim();
    let mut url = if raw.contains("://") {
        raw.to_string()
    } else if raw == "localhost" || raw.starts_with("localhost:") || raw.starts_with("localhost/") {
        format!("http://{raw}")
    } else {
        format!("https://{raw}")
    };
    if !url.ends_with('/') {
        url.push('/');
    }
    url
}
