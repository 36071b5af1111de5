//! Status reporting capability.
//!
//! The orchestrator never depends on a concrete front end; it pushes a
//! [`StatusReport`] to whatever [`Reporter`] backend the binary wires in.

use std::sync::Mutex;
use tracing::info;

/// Snapshot pushed to the reporter after every state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    /// Clients currently being relayed.
    pub active: usize,
    /// Clients served over the last day.
    pub total: u64,
    /// Whether the proxy is polling the broker.
    pub enabled: bool,
    /// Capability the host lacks (e.g. WebRTC), if any.
    pub missing_feature: Option<String>,
}

/// Backend adapter for presenting proxy status.
pub trait Reporter: Send + Sync {
    fn report(&self, status: &StatusReport);
}

/// Writes status changes to the log, suppressing unchanged repeats.
#[derive(Debug, Default)]
pub struct LogReporter {
    last: Mutex<Option<StatusReport>>,
}

impl LogReporter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Reporter for LogReporter {
    fn report(&self, status: &StatusReport) {
        let Ok(mut last) = self.last.lock() else {
            return;
        };
        if last.as_ref() == Some(status) {
            return;
        }
        info!(
            active = status.active,
            served_24h = status.total,
            enabled = status.enabled,
            missing_feature = status.missing_feature.as_deref().unwrap_or("-"),
            "proxy status"
        );
        *last = Some(status.clone());
    }
}
