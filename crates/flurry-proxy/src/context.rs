//! Dependencies shared by the orchestrator, sessions and the NAT probe.

use crate::broker::Signaling;
use crate::config::ProxyConfig;
use crate::report::Reporter;
use crate::stats::ClientStats;
use flurry_core::rate_limit;
use flurry_core::{PeerFactory, RelayDialer, SharedRateLimit};
use std::sync::Arc;

/// Explicit dependency bundle, built once at startup and cloned into every
/// component that needs it.
#[derive(Clone)]
pub struct ProxyContext {
    pub config: Arc<ProxyConfig>,
    pub signaling: Arc<dyn Signaling>,
    pub peers: Arc<dyn PeerFactory>,
    pub relays: Arc<dyn RelayDialer>,
    /// The one limiter every session forwards through.
    pub limiter: SharedRateLimit,
    pub stats: Arc<ClientStats>,
    pub reporter: Arc<dyn Reporter>,
}

impl ProxyContext {
    pub fn new(
        config: ProxyConfig,
        signaling: Arc<dyn Signaling>,
        peers: Arc<dyn PeerFactory>,
        relays: Arc<dyn RelayDialer>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        let limiter = rate_limit::from_config(config.rate_limit_bytes, config.rate_limit_window);
        Self {
            config: Arc::new(config),
            signaling,
            peers,
            relays,
            limiter,
            stats: Arc::new(ClientStats::new()),
            reporter,
        }
    }
}
