//! The control loop: bounded concurrency, broker polling and adaptive
//! poll interval.
//!
//! [`Orchestrator`] runs as a single task that owns the [`PollState`] and
//! the handles of all live sessions. Everything else talks to it through an
//! [`OrchestratorHandle`] or through the internal event channel that poll
//! tasks, open-check timers, session cleanups and the NAT probe report into.

use crate::broker::PollOutcome;
use crate::config::ProxyConfig;
use crate::context::ProxyContext;
use crate::nat::{NatProbe, ProbeOutcome};
use crate::report::StatusReport;
use crate::session::{sleep_until_opt, ProxyPair, SessionHandle};
use flurry_core::{FlurryError, FlurryResult, NatType};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const STATS_ROTATION: Duration = Duration::from_secs(60 * 60);

/// Adaptive polling state, mutated only by the control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollState {
    pub interval: Duration,
    /// Polls since the last client match.
    pub retries: u64,
    /// Consecutive open timeouts with restricted clients.
    pub nat_failures: u32,
    /// This proxy's own NAT classification.
    pub nat: NatType,
    pub max_clients: usize,
}

impl PollState {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            interval: config.default_poll_interval,
            retries: 0,
            nat_failures: 0,
            nat: NatType::Unknown,
            max_clients: config.max_clients,
        }
    }

    /// A client's data channel failed to open in time.
    pub fn record_open_timeout(&mut self, config: &ProxyConfig, client_nat: NatType) {
        self.interval = self.interval.saturating_add(config.poll_adjustment);

        if client_nat == NatType::Restricted {
            self.nat_failures += 1;
        }
        if self.nat_failures >= config.nat_failure_threshold {
            info!(failures = self.nat_failures, "classifying own NAT as restricted");
            self.nat = NatType::Restricted;
            self.max_clients = 1;
            self.nat_failures = 0;
        }
        self.clamp(config);
    }

    /// A client's data channel opened in time.
    pub fn record_open_success(&mut self, config: &ProxyConfig) {
        self.interval = self
            .interval
            .saturating_sub(config.poll_adjustment)
            .max(config.default_poll_interval);
        self.nat_failures = 0;

        if self.nat == NatType::Unrestricted {
            self.max_clients = self.max_clients.max(config.unrestricted_max_clients);
            self.interval = config.fast_poll_interval;
        }
        self.clamp(config);
    }

    fn clamp(&mut self, config: &ProxyConfig) {
        self.interval = self
            .interval
            .clamp(config.fast_poll_interval, config.slowest_poll_interval);
    }
}

/// Snapshot returned by [`OrchestratorHandle::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorStatus {
    pub enabled: bool,
    pub poll: PollState,
    pub sessions: usize,
    pub active_clients: usize,
    pub served_last_day: u64,
    pub missing_feature: Option<String>,
}

enum Command {
    Enable,
    Disable,
    Status(oneshot::Sender<OrchestratorStatus>),
    Shutdown(oneshot::Sender<()>),
}

enum Event {
    /// A poll produced a session with an applied offer.
    Matched {
        pair: ProxyPair,
        client_nat: NatType,
    },
    /// A poll ended without a session to keep.
    PollFinished,
    /// Peer connections cannot be created on this host.
    PeerUnavailable(String),
    OpenCheck {
        sid: String,
        client_nat: NatType,
    },
    SessionClosed(String),
    NatProbed(ProbeOutcome),
}

/// Control handle for a running [`Orchestrator`].
#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<Command>,
}

impl OrchestratorHandle {
    pub async fn enable(&self) -> FlurryResult<()> {
        self.send(Command::Enable).await
    }

    /// Stop polling and close every live session.
    pub async fn disable(&self) -> FlurryResult<()> {
        self.send(Command::Disable).await
    }

    pub async fn status(&self) -> FlurryResult<OrchestratorStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Status(tx)).await?;
        rx.await.map_err(|_| FlurryError::ChannelClosed)
    }

    /// Close all sessions, wait for them to finish and stop the loop.
    pub async fn shutdown(&self) -> FlurryResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Shutdown(tx)).await?;
        rx.await.map_err(|_| FlurryError::ChannelClosed)
    }

    async fn send(&self, cmd: Command) -> FlurryResult<()> {
        self.tx.send(cmd).await.map_err(|_| FlurryError::ChannelClosed)
    }
}

pub struct Orchestrator {
    ctx: ProxyContext,
    poll: PollState,
    sessions: HashMap<String, SessionHandle>,
    enabled: bool,
    /// A poll task is in flight.
    polling: bool,
    missing_feature: Option<String>,
    next_poll: Option<Instant>,
    next_nat_check: Option<Instant>,
    next_rotation: Instant,
    commands: mpsc::Receiver<Command>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
}

impl Orchestrator {
    /// Start the control loop, enabled, on its own task.
    pub fn spawn(ctx: ProxyContext) -> OrchestratorHandle {
        let (tx, commands) = mpsc::channel(16);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let now = Instant::now();

        let orchestrator = Self {
            poll: PollState::new(&ctx.config),
            next_nat_check: ctx.config.nat_probe.then_some(now),
            next_rotation: now + STATS_ROTATION,
            ctx,
            sessions: HashMap::new(),
            enabled: true,
            polling: false,
            missing_feature: None,
            next_poll: Some(now),
            commands,
            events_tx,
            events_rx,
        };
        tokio::spawn(orchestrator.run());

        OrchestratorHandle { tx }
    }

    async fn run(mut self) {
        info!("polling enabled");
        self.report();
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Enable) => self.enable(),
                    Some(Command::Disable) => self.disable(),
                    Some(Command::Status(reply)) => {
                        let _ = reply.send(self.status());
                    }
                    Some(Command::Shutdown(ack)) => {
                        self.shutdown().await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = self.events_rx.recv() => self.on_event(event).await,
                _ = sleep_until_opt(self.next_poll) => {
                    self.next_poll = Some(Instant::now() + self.poll.interval);
                    self.poll_broker();
                }
                _ = sleep_until_opt(self.next_nat_check) => {
                    self.next_nat_check = Some(Instant::now() + self.ctx.config.nat_check_interval);
                    self.start_nat_probe();
                }
                _ = tokio::time::sleep_until(self.next_rotation) => {
                    self.next_rotation += STATS_ROTATION;
                    self.ctx.stats.rotate_hour();
                    self.report();
                }
            }
        }
        info!("orchestrator stopped");
    }

    fn enable(&mut self) {
        if self.enabled {
            return;
        }
        info!("polling enabled");
        self.enabled = true;
        self.next_poll = Some(Instant::now());
        self.report();
    }

    fn disable(&mut self) {
        if self.enabled {
            info!(sessions = self.sessions.len(), "polling disabled");
        }
        self.enabled = false;
        self.next_poll = None;
        for handle in self.sessions.values() {
            handle.close();
        }
        self.report();
    }

    async fn shutdown(&mut self) {
        self.disable();
        for (_, handle) in self.sessions.drain() {
            handle.join().await;
        }
    }

    /// One poll cycle. Skips when at capacity or a poll is still in flight;
    /// the broker exchange itself runs on its own task.
    fn poll_broker(&mut self) {
        if !self.enabled || self.polling {
            return;
        }
        if self.sessions.len() >= self.poll.max_clients {
            debug!(
                sessions = self.sessions.len(),
                max = self.poll.max_clients,
                "at capacity, skipping poll"
            );
            return;
        }

        self.polling = true;
        self.poll.retries += 1;
        let ctx = self.ctx.clone();
        let events = self.events_tx.clone();
        let active = self.sessions.len();
        let nat = self.poll.nat;
        tokio::spawn(async move {
            let event = poll_once(ctx, active, nat).await;
            let _ = events.send(event);
        });
    }

    fn start_nat_probe(&self) {
        let probe = NatProbe::new(self.ctx.clone());
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let outcome = probe.run().await;
            let _ = events.send(Event::NatProbed(outcome));
        });
    }

    async fn on_event(&mut self, event: Event) {
        match event {
            Event::Matched { pair, client_nat } => {
                self.polling = false;
                if !self.enabled {
                    pair.abort().await;
                    return;
                }
                self.poll.retries = 0;

                let sid = pair.id().to_string();
                let events = self.events_tx.clone();
                let handle = pair.spawn(move |sid| {
                    let _ = events.send(Event::SessionClosed(sid));
                });
                self.sessions.insert(sid.clone(), handle);

                let events = self.events_tx.clone();
                let timeout = self.ctx.config.datachannel_timeout;
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    let _ = events.send(Event::OpenCheck { sid, client_nat });
                });
                self.report();
            }
            Event::PollFinished => self.polling = false,
            Event::PeerUnavailable(reason) => {
                self.polling = false;
                error!(%reason, "WebRTC is unavailable, stopping");
                self.missing_feature = Some("webrtc".into());
                self.disable();
            }
            Event::OpenCheck { sid, client_nat } => {
                let config = self.ctx.config.clone();
                match self.sessions.get(&sid) {
                    Some(handle) if handle.is_channel_open() => {
                        self.poll.record_open_success(&config);
                        debug!(sid = %sid, interval = ?self.poll.interval, "data channel opened in time");
                    }
                    other => {
                        if let Some(handle) = other {
                            handle.close();
                        }
                        self.poll.record_open_timeout(&config, client_nat);
                        info!(
                            sid,
                            interval = ?self.poll.interval,
                            nat_failures = self.poll.nat_failures,
                            "data channel did not open in time"
                        );
                    }
                }
            }
            Event::SessionClosed(sid) => {
                self.sessions.remove(&sid);
                self.report();
            }
            Event::NatProbed(ProbeOutcome::Classified(nat)) => {
                if nat != self.poll.nat {
                    info!(nat = %nat, "NAT classification updated");
                }
                self.poll.nat = nat;
            }
            Event::NatProbed(ProbeOutcome::Unreachable(reason)) => {
                warn!(%reason, nat = %self.poll.nat, "keeping NAT classification");
            }
        }
    }

    fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            enabled: self.enabled,
            poll: self.poll.clone(),
            sessions: self.sessions.len(),
            active_clients: self.ctx.stats.active(),
            served_last_day: self.ctx.stats.total_last_day(),
            missing_feature: self.missing_feature.clone(),
        }
    }

    fn report(&self) {
        self.ctx.reporter.report(&StatusReport {
            active: self.ctx.stats.active(),
            total: self.ctx.stats.total_last_day(),
            enabled: self.enabled,
            missing_feature: self.missing_feature.clone(),
        });
    }
}

/// Create a session, ask the broker for an offer and apply it.
async fn poll_once(ctx: ProxyContext, active: usize, nat: NatType) -> Event {
    let sid = generate_session_id();
    let mut pair = match ProxyPair::new(sid.clone(), ctx.clone()).await {
        Ok(pair) => pair,
        Err(e) => return Event::PeerUnavailable(e.to_string()),
    };

    match ctx.signaling.get_offer(&sid, active, nat).await {
        Ok(PollOutcome::Match(offer)) => match pair.receive_offer(&offer).await {
            Ok(()) => {
                info!(sid = %sid, client_nat = %offer.client_nat, "client matched");
                Event::Matched {
                    pair,
                    client_nat: offer.client_nat,
                }
            }
            Err(e) => {
                warn!(sid = %sid, error = %e, "rejecting client offer");
                pair.abort().await;
                Event::PollFinished
            }
        },
        Ok(PollOutcome::NoMatch) => {
            debug!(sid = %sid, "no client match");
            pair.abort().await;
            Event::PollFinished
        }
        Err(e) => {
            warn!(sid = %sid, error = %e, "broker poll failed");
            pair.abort().await;
            Event::PollFinished
        }
    }
}

fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}
