//! NAT self-test.
//!
//! Opens a data channel towards the probe endpoint. If the channel opens
//! within the probe timeout the proxy can be reached by restricted clients
//! too and is classified unrestricted; otherwise it is restricted.

use crate::context::ProxyContext;
use flurry_core::{FlurryResult, NatType, PeerConnection, PeerEvent};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const PROBE_LABEL: &str = "probe";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Classified(NatType),
    /// The probe could not be run; the current classification stands.
    Unreachable(String),
}

pub struct NatProbe {
    ctx: ProxyContext,
}

impl NatProbe {
    pub fn new(ctx: ProxyContext) -> Self {
        Self { ctx }
    }

    pub async fn run(&self) -> ProbeOutcome {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let peer = match self.ctx.peers.create(tx).await {
            Ok(peer) => peer,
            Err(e) => {
                warn!(error = %e, "cannot create probe connection");
                return ProbeOutcome::Unreachable(e.to_string());
            }
        };

        let outcome = match self.negotiate(peer.as_ref()).await {
            Ok(()) => {
                let opened = tokio::time::timeout(self.ctx.config.nat_probe_timeout, async {
                    while let Some(event) = rx.recv().await {
                        match event {
                            PeerEvent::ChannelOpen(_) => return true,
                            PeerEvent::Failed(reason) => {
                                debug!(%reason, "probe connection failed");
                                return false;
                            }
                            _ => {}
                        }
                    }
                    false
                })
                .await
                .unwrap_or(false);

                let nat = if opened {
                    NatType::Unrestricted
                } else {
                    NatType::Restricted
                };
                info!(nat = %nat, "NAT probe finished");
                ProbeOutcome::Classified(nat)
            }
            Err(e) => {
                warn!(error = %e, "NAT probe endpoint unreachable");
                ProbeOutcome::Unreachable(e.to_string())
            }
        };

        peer.close().await;
        outcome
    }

    async fn negotiate(&self, peer: &dyn PeerConnection) -> FlurryResult<()> {
        let offer = peer.create_probe_offer(PROBE_LABEL).await?;
        let answer = self.ctx.signaling.probe(&offer).await?;
        peer.accept_answer(&answer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{harness, test_config};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn open_channel_means_unrestricted() {
        let h = harness(test_config());
        h.peers.probe_opens.store(true, Ordering::SeqCst);

        let outcome = NatProbe::new(h.ctx.clone()).run().await;
        assert_eq!(outcome, ProbeOutcome::Classified(NatType::Unrestricted));
        assert_eq!(h.signaling.probes.load(Ordering::SeqCst), 1);
        assert!(h.peers.last().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_means_restricted() {
        let h = harness(test_config());
        let start = tokio::time::Instant::now();

        let outcome = NatProbe::new(h.ctx.clone()).run().await;
        assert_eq!(outcome, ProbeOutcome::Classified(NatType::Restricted));
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert!(h.peers.last().is_closed());
    }

    #[tokio::test]
    async fn endpoint_failure_is_unreachable() {
        let h = harness(test_config());
        h.signaling.probe_fails.store(true, Ordering::SeqCst);

        let outcome = NatProbe::new(h.ctx.clone()).run().await;
        assert!(matches!(outcome, ProbeOutcome::Unreachable(_)));
        assert!(h.peers.last().is_closed());
    }

    #[tokio::test]
    async fn missing_webrtc_is_unreachable() {
        let h = harness(test_config());
        h.peers.fail.store(true, Ordering::SeqCst);
        assert!(matches!(
            NatProbe::new(h.ctx.clone()).run().await,
            ProbeOutcome::Unreachable(_)
        ));
    }
}
