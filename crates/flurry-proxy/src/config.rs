//! Proxy configuration: TOML file + CLI overrides.
//!
//! Everything is resolved once at startup into an immutable [`ProxyConfig`]
//! that the rest of the proxy shares behind an `Arc`.

use flurry_core::{normalize_broker_url, FlurryError, FlurryResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub poll: PollSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub rate_limit: RateLimitSection,
    #[serde(default)]
    pub nat: NatSection,
}

/// `[broker]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerSection {
    #[serde(default = "default_broker_url")]
    pub url: String,
    #[serde(default = "default_proxy_type")]
    pub proxy_type: String,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            proxy_type: default_proxy_type(),
        }
    }
}

/// `[relay]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySection {
    #[serde(default = "default_relay_host")]
    pub host: String,
    #[serde(default = "default_relay_port")]
    pub port: u16,
    #[serde(default = "default_relay_pattern")]
    pub allowed_pattern: String,
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            host: default_relay_host(),
            port: default_relay_port(),
            allowed_pattern: default_relay_pattern(),
            ice_servers: default_ice_servers(),
        }
    }
}

/// `[poll]` section of the config TOML. All values in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct PollSection {
    #[serde(default = "default_poll_interval")]
    pub default_interval: u64,
    #[serde(default = "default_fast_poll_interval")]
    pub fast_interval: u64,
    #[serde(default = "default_slowest_poll_interval")]
    pub slowest_interval: u64,
    #[serde(default = "default_poll_adjustment")]
    pub adjustment: u64,
}

impl Default for PollSection {
    fn default() -> Self {
        Self {
            default_interval: default_poll_interval(),
            fast_interval: default_fast_poll_interval(),
            slowest_interval: default_slowest_poll_interval(),
            adjustment: default_poll_adjustment(),
        }
    }
}

/// `[session]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    #[serde(default = "default_unrestricted_max_clients")]
    pub unrestricted_max_clients: usize,
    #[serde(default = "default_message_timeout")]
    pub message_timeout: u64,
    #[serde(default = "default_datachannel_timeout")]
    pub datachannel_timeout: u64,
    #[serde(default = "default_relay_connect_timeout")]
    pub relay_connect_timeout: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            max_clients: default_max_clients(),
            unrestricted_max_clients: default_unrestricted_max_clients(),
            message_timeout: default_message_timeout(),
            datachannel_timeout: default_datachannel_timeout(),
            relay_connect_timeout: default_relay_connect_timeout(),
        }
    }
}

/// `[rate_limit]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSection {
    /// Aggregate cap in bytes per second; absent = unlimited.
    #[serde(default)]
    pub bytes_per_sec: Option<u64>,
    #[serde(default = "default_rate_window")]
    pub window: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            bytes_per_sec: None,
            window: default_rate_window(),
        }
    }
}

/// `[nat]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct NatSection {
    #[serde(default = "default_true")]
    pub probe: bool,
    #[serde(default = "default_probe_url")]
    pub probe_url: String,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout: u64,
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

impl Default for NatSection {
    fn default() -> Self {
        Self {
            probe: true,
            probe_url: default_probe_url(),
            probe_timeout: default_probe_timeout(),
            check_interval: default_check_interval(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

fn default_broker_url() -> String {
    "snowflake-broker.torproject.net".to_string()
}
fn default_proxy_type() -> String {
    "standalone".to_string()
}
fn default_relay_host() -> String {
    "snowflake.torproject.net".to_string()
}
fn default_relay_port() -> u16 {
    443
}
fn default_relay_pattern() -> String {
    "snowflake.torproject.net$".to_string()
}
fn default_ice_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}
fn default_poll_interval() -> u64 {
    60
}
fn default_fast_poll_interval() -> u64 {
    30
}
fn default_slowest_poll_interval() -> u64 {
    6 * 60 * 60
}
fn default_poll_adjustment() -> u64 {
    100
}
fn default_max_clients() -> usize {
    1
}
fn default_unrestricted_max_clients() -> usize {
    2
}
fn default_message_timeout() -> u64 {
    30
}
fn default_datachannel_timeout() -> u64 {
    20
}
fn default_relay_connect_timeout() -> u64 {
    5
}
fn default_rate_window() -> u64 {
    5
}
fn default_probe_url() -> String {
    "https://snowflake-broker.torproject.net:8443/probe".to_string()
}
fn default_probe_timeout() -> u64 {
    10
}
fn default_check_interval() -> u64 {
    2 * 24 * 60 * 60
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_true() -> bool {
    true
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub broker: Option<String>,
    pub relay_host: Option<String>,
    pub relay_port: Option<u16>,
    pub allowed_relay_pattern: Option<String>,
    pub max_clients: Option<usize>,
    pub rate_limit: Option<u64>,
    pub disable_nat_probe: bool,
}

/// Resolved proxy configuration (CLI overrides applied, URLs normalised).
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub broker_url: String,
    pub probe_url: String,
    pub relay_host: String,
    pub relay_port: u16,
    pub allowed_relay_pattern: String,
    pub ice_servers: Vec<String>,
    pub proxy_type: String,
    pub default_poll_interval: Duration,
    pub fast_poll_interval: Duration,
    pub slowest_poll_interval: Duration,
    pub poll_adjustment: Duration,
    pub message_timeout: Duration,
    pub datachannel_timeout: Duration,
    pub relay_connect_timeout: Duration,
    pub max_clients: usize,
    pub unrestricted_max_clients: usize,
    pub nat_failure_threshold: u32,
    pub rate_limit_bytes: Option<u64>,
    pub rate_limit_window: Duration,
    pub nat_probe: bool,
    pub nat_probe_timeout: Duration,
    pub nat_check_interval: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::from_file(ConfigFile::default(), &Overrides::default())
    }
}

impl ProxyConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: &Overrides) -> FlurryResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse_config_file(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let config = Self::from_file(file_config, overrides);
        config.validate()?;
        Ok(config)
    }

    fn from_file(file: ConfigFile, overrides: &Overrides) -> Self {
        let broker = overrides.broker.clone().unwrap_or(file.broker.url);
        let secs = Duration::from_secs;

        Self {
            broker_url: normalize_broker_url(&broker),
            probe_url: file.nat.probe_url,
            relay_host: overrides.relay_host.clone().unwrap_or(file.relay.host),
            relay_port: overrides.relay_port.unwrap_or(file.relay.port),
            allowed_relay_pattern: overrides
                .allowed_relay_pattern
                .clone()
                .unwrap_or(file.relay.allowed_pattern),
            ice_servers: file.relay.ice_servers,
            proxy_type: file.broker.proxy_type,
            default_poll_interval: secs(file.poll.default_interval),
            fast_poll_interval: secs(file.poll.fast_interval),
            slowest_poll_interval: secs(file.poll.slowest_interval),
            poll_adjustment: secs(file.poll.adjustment),
            message_timeout: secs(file.session.message_timeout),
            datachannel_timeout: secs(file.session.datachannel_timeout),
            relay_connect_timeout: secs(file.session.relay_connect_timeout),
            max_clients: overrides.max_clients.unwrap_or(file.session.max_clients),
            unrestricted_max_clients: file.session.unrestricted_max_clients,
            nat_failure_threshold: file.nat.failure_threshold,
            rate_limit_bytes: overrides.rate_limit.or(file.rate_limit.bytes_per_sec),
            rate_limit_window: secs(file.rate_limit.window),
            nat_probe: file.nat.probe && !overrides.disable_nat_probe,
            nat_probe_timeout: secs(file.nat.probe_timeout),
            nat_check_interval: secs(file.nat.check_interval),
        }
    }

    /// Reject combinations the control loop cannot honour.
    pub fn validate(&self) -> FlurryResult<()> {
        if self.fast_poll_interval.is_zero() {
            return Err(FlurryError::Config("fast poll interval must be positive".into()));
        }
        if !(self.fast_poll_interval <= self.default_poll_interval
            && self.default_poll_interval <= self.slowest_poll_interval)
        {
            return Err(FlurryError::Config(
                "poll intervals must satisfy fast <= default <= slowest".into(),
            ));
        }
        if self.max_clients == 0 {
            return Err(FlurryError::Config("max_clients must be at least 1".into()));
        }
        if self.message_timeout.is_zero() || self.datachannel_timeout.is_zero() {
            return Err(FlurryError::Config("session timeouts must be positive".into()));
        }
        if self.relay_host.is_empty() {
            return Err(FlurryError::Config("relay host must not be empty".into()));
        }
        if let Some(rate) = self.rate_limit_bytes {
            if rate == 0 {
                return Err(FlurryError::Config("rate limit must be positive".into()));
            }
            if self.rate_limit_window.is_zero() {
                return Err(FlurryError::Config("rate limit window must be positive".into()));
            }
        }
        Ok(())
    }
}

fn parse_config_file(content: &str) -> FlurryResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| FlurryError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
