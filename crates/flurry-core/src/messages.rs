//! Broker wire messages, session descriptions, and NAT classification.
//!
//! All broker bodies are JSON objects with PascalCase keys. Offers and
//! answers travel as *strings* holding a JSON-encoded [`SessionDescription`].

use crate::error::{FlurryError, FlurryResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Broker protocol version sent with every poll and answer.
pub const PROTOCOL_VERSION: &str = "1.3";

/// Poll response status: a client was matched to this proxy.
pub const STATUS_CLIENT_MATCH: &str = "client match";

/// Poll response status: no client is waiting.
pub const STATUS_NO_MATCH: &str = "no match";

/// Coarse NAT classification of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NatType {
    #[default]
    Unknown,
    Restricted,
    Unrestricted,
}

impl NatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NatType::Unknown => "unknown",
            NatType::Restricted => "restricted",
            NatType::Unrestricted => "unrestricted",
        }
    }

    /// Lenient parse for broker-reported values; anything unrecognised is `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s {
            "restricted" => NatType::Restricted,
            "unrestricted" => NatType::Unrestricted,
            _ => NatType::Unknown,
        }
    }
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SDP message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// A session description exchanged during negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Decode a broker-supplied offer string, rejecting anything that is not
    /// a well-formed description of type `"offer"`.
    pub fn parse_offer(json: &str) -> FlurryResult<Self> {
        let desc: SessionDescription = serde_json::from_str(json)
            .map_err(|e| FlurryError::InvalidOffer(format!("malformed description: {e}")))?;
        if desc.sdp_type != SdpType::Offer {
            return Err(FlurryError::InvalidOffer(format!(
                "expected type offer, got {:?}",
                desc.sdp_type
            )));
        }
        Ok(desc)
    }

    /// Decode a probe-endpoint answer string.
    pub fn parse_answer(json: &str) -> FlurryResult<Self> {
        let desc: SessionDescription = serde_json::from_str(json)
            .map_err(|e| FlurryError::InvalidAnswer(format!("malformed description: {e}")))?;
        if desc.sdp_type != SdpType::Answer {
            return Err(FlurryError::InvalidAnswer(format!(
                "expected type answer, got {:?}",
                desc.sdp_type
            )));
        }
        Ok(desc)
    }

    /// JSON string form used inside broker bodies.
    pub fn to_json(&self) -> FlurryResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ── Broker bodies ────────────────────────────────────────────────────

/// Proxy registration / poll request (`POST <broker>/proxy`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyPollRequest {
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Sid")]
    pub sid: String,
    #[serde(rename = "Type")]
    pub proxy_type: String,
    #[serde(rename = "NAT")]
    pub nat: NatType,
    #[serde(rename = "Clients")]
    pub clients: usize,
    #[serde(rename = "AcceptedRelayPattern")]
    pub accepted_relay_pattern: String,
}

/// Broker reply to a poll.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyPollResponse {
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Offer", default)]
    pub offer: Option<String>,
    #[serde(rename = "RelayURL", default)]
    pub relay_url: Option<String>,
    #[serde(rename = "NAT", default)]
    pub nat: Option<String>,
}

/// Answer submission (`POST <broker>/answer`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerRequest {
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Sid")]
    pub sid: String,
    #[serde(rename = "Answer")]
    pub answer: String,
}

/// NAT probe request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeRequest {
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Offer")]
    pub offer: String,
}

/// NAT probe reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResponse {
    #[serde(rename = "Answer")]
    pub answer: String,
}

/// Round an active-client count down to a multiple of 8 before reporting it.
pub fn coarse_client_count(clients: usize) -> usize {
    (clients / 8) * 8
}
