//! One client session: a WebRTC data channel paired with a relay connection.
//!
//! A [`ProxyPair`] is built and handed its offer by the orchestrator, then
//! spawned onto its own task. The task owns all session state and reacts to
//! peer events, relay events, timers and the close signal from its
//! [`SessionHandle`]; nothing else mutates it.

use crate::broker::ClientOffer;
use crate::context::ProxyContext;
use bytes::Bytes;
use flurry_core::parse::parse_relay_url;
use flurry_core::{
    build_url, ip_from_sdp, ChannelEvent, DataChannel, FlurryError, FlurryResult,
    PeerConnection, PeerEvent, RateLimit, SessionDescription,
};
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

/// Forwarding stops while a destination has this much queued for sending.
pub const MAX_BUFFER: usize = 10 * 1024 * 1024;

/// Lower bound on the wait before a deferred flush.
const FLUSH_MIN_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Negotiating,
    DataChannelOpen,
    RelayConnecting,
    Relaying,
    Closed,
}

impl SessionState {
    /// Whether the client's data channel has opened and the session is
    /// still alive.
    pub fn channel_open(&self) -> bool {
        matches!(
            self,
            SessionState::DataChannelOpen | SessionState::RelayConnecting | SessionState::Relaying
        )
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Requested,
    ClientClosed,
    ClientError(String),
    RelayClosed,
    RelayError(String),
    PeerFailed(String),
    /// No client message within the message timeout.
    Stale,
    RelayConnectTimeout,
    /// The session never got past negotiation.
    Abandoned,
}

/// Sleep until `deadline`, or forever when there is none.
pub(crate) async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

pub struct ProxyPair {
    id: String,
    ctx: ProxyContext,
    peer: Arc<dyn PeerConnection>,
    peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    relay_tx: mpsc::UnboundedSender<ChannelEvent>,
    relay_rx: mpsc::UnboundedReceiver<ChannelEvent>,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    client: Option<Arc<dyn DataChannel>>,
    relay: Option<Arc<dyn DataChannel>>,
    /// Client to relay.
    c2r: VecDeque<Bytes>,
    /// Relay to client.
    r2c: VecDeque<Bytes>,
    /// Whether this session has been added to the active-client count.
    counted: bool,
    answer_sent: bool,
    relay_override: Option<Url>,
    client_ip: Option<IpAddr>,
    stale_deadline: Option<Instant>,
    connect_deadline: Option<Instant>,
    flush_deadline: Option<Instant>,
}

/// Owner's view of a spawned session.
pub struct SessionHandle {
    id: String,
    state: watch::Receiver<SessionState>,
    close_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_channel_open(&self) -> bool {
        self.state().channel_open()
    }

    /// Ask the session to close. Safe to call repeatedly.
    pub fn close(&self) {
        let _ = self.close_tx.try_send(());
    }

    /// Wait until the session reports [`SessionState::Closed`].
    pub async fn closed(&mut self) {
        let _ = self.state.wait_for(|s| *s == SessionState::Closed).await;
    }

    /// Wait for the session task to finish, including its cleanup.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(sid = %self.id, error = %e, "session task failed");
        }
    }
}

impl ProxyPair {
    /// Create the session and its peer connection.
    pub async fn new(id: String, ctx: ProxyContext) -> FlurryResult<Self> {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let peer = ctx.peers.create(peer_tx).await?;
        let (state_tx, _) = watch::channel(SessionState::Created);

        Ok(Self {
            id,
            ctx,
            peer,
            peer_rx,
            relay_tx,
            relay_rx,
            state: SessionState::Created,
            state_tx,
            client: None,
            relay: None,
            c2r: VecDeque::new(),
            r2c: VecDeque::new(),
            counted: false,
            answer_sent: false,
            relay_override: None,
            client_ip: None,
            stale_deadline: None,
            connect_deadline: None,
            flush_deadline: None,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Validate and apply a client offer.
    ///
    /// The offer must be an `offer`-typed description and any relay URL the
    /// broker supplied must pass the allowed-relay check. Nothing changes on
    /// error.
    pub async fn receive_offer(&mut self, offer: &ClientOffer) -> FlurryResult<()> {
        if self.state != SessionState::Created {
            return Err(FlurryError::InvalidOffer(format!(
                "session already in state {:?}",
                self.state
            )));
        }

        let desc = SessionDescription::parse_offer(&offer.offer)?;

        let relay_override = match offer.relay_url.as_deref() {
            Some(raw) => Some(parse_relay_url(raw, &self.ctx.config.allowed_relay_pattern)?),
            None => None,
        };

        self.peer.accept_offer(&desc).await?;

        self.client_ip = ip_from_sdp(&desc.sdp);
        self.relay_override = relay_override;
        self.set_state(SessionState::Negotiating);
        debug!(sid = %self.id, client_ip = ?self.client_ip, "offer applied");
        Ok(())
    }

    /// Move the session onto its own task.
    ///
    /// `on_cleanup` runs exactly once with the session id after the session
    /// has released everything it holds.
    pub fn spawn<F>(mut self, on_cleanup: F) -> SessionHandle
    where
        F: FnOnce(String) + Send + 'static,
    {
        let (close_tx, mut close_rx) = mpsc::channel::<()>(1);
        let id = self.id.clone();
        let state = self.state_tx.subscribe();

        let task = tokio::spawn(async move {
            let reason = self.run(&mut close_rx).await;
            self.shutdown(reason).await;
            on_cleanup(self.id.clone());
        });

        SessionHandle {
            id,
            state,
            close_tx,
            task,
        }
    }

    /// Close a session that was never spawned.
    pub async fn abort(mut self) {
        self.shutdown(CloseReason::Abandoned).await;
    }

    async fn run(&mut self, close_rx: &mut mpsc::Receiver<()>) -> CloseReason {
        loop {
            let outcome = tokio::select! {
                _ = close_rx.recv() => Some(CloseReason::Requested),
                Some(event) = self.peer_rx.recv() => self.on_peer_event(event),
                Some(event) = self.relay_rx.recv() => self.on_relay_event(event),
                _ = sleep_until_opt(self.stale_deadline) => Some(CloseReason::Stale),
                _ = sleep_until_opt(self.connect_deadline) => Some(CloseReason::RelayConnectTimeout),
                _ = sleep_until_opt(self.flush_deadline) => {
                    self.flush();
                    None
                }
            };
            if let Some(reason) = outcome {
                return reason;
            }
        }
    }

    fn on_peer_event(&mut self, event: PeerEvent) -> Option<CloseReason> {
        match event {
            PeerEvent::LocalDescription(answer) => {
                if !self.answer_sent {
                    self.answer_sent = true;
                    let signaling = self.ctx.signaling.clone();
                    let sid = self.id.clone();
                    tokio::spawn(async move {
                        signaling.send_answer(&sid, &answer).await;
                    });
                }
                None
            }
            PeerEvent::ChannelOpen(channel) => self.on_client_open(channel),
            PeerEvent::Channel(ChannelEvent::Message(data)) => {
                self.stale_deadline = Some(Instant::now() + self.ctx.config.message_timeout);
                self.c2r.push_back(data);
                self.flush();
                None
            }
            PeerEvent::Channel(ChannelEvent::Drained) => {
                self.flush();
                None
            }
            PeerEvent::Channel(ChannelEvent::Open) => None,
            PeerEvent::Channel(ChannelEvent::Closed) => Some(CloseReason::ClientClosed),
            PeerEvent::Channel(ChannelEvent::Error(e)) => Some(CloseReason::ClientError(e)),
            PeerEvent::Failed(e) => Some(CloseReason::PeerFailed(e)),
        }
    }

    fn on_client_open(&mut self, channel: Arc<dyn DataChannel>) -> Option<CloseReason> {
        if self.client.is_some() {
            warn!(sid = %self.id, "ignoring second data channel");
            channel.close();
            return None;
        }

        info!(sid = %self.id, "data channel opened");
        self.client = Some(channel);
        self.set_state(SessionState::DataChannelOpen);
        if !self.counted {
            self.counted = true;
            self.ctx.stats.increase();
        }
        self.stale_deadline = Some(Instant::now() + self.ctx.config.message_timeout);

        let url = match self.relay_url() {
            Ok(url) => url,
            Err(e) => return Some(CloseReason::RelayError(e.to_string())),
        };
        info!(sid = %self.id, relay = %url.host_str().unwrap_or_default(), "connecting to relay");
        self.relay = Some(self.ctx.relays.dial(&url, self.relay_tx.clone()));
        self.connect_deadline = Some(Instant::now() + self.ctx.config.relay_connect_timeout);
        self.set_state(SessionState::RelayConnecting);
        None
    }

    /// The relay to dial: the broker's choice if it gave one, otherwise the
    /// configured relay, annotated with the client's address when known.
    fn relay_url(&self) -> FlurryResult<Url> {
        let client_ip = self.client_ip.map(|ip| ip.to_string());

        match &self.relay_override {
            Some(url) => {
                let mut url = url.clone();
                if let Some(ip) = &client_ip {
                    url.query_pairs_mut().append_pair("client_ip", ip);
                }
                Ok(url)
            }
            None => {
                let config = &self.ctx.config;
                let params: Vec<(&str, &str)> = client_ip
                    .as_deref()
                    .map(|ip| vec![("client_ip", ip)])
                    .unwrap_or_default();
                let raw = build_url("wss", &config.relay_host, Some(config.relay_port), "/", &params);
                Ok(Url::parse(&raw)?)
            }
        }
    }

    fn on_relay_event(&mut self, event: ChannelEvent) -> Option<CloseReason> {
        match event {
            ChannelEvent::Open => {
                info!(sid = %self.id, "relay connected");
                self.connect_deadline = None;
                self.set_state(SessionState::Relaying);
                self.flush();
                None
            }
            ChannelEvent::Message(data) => {
                self.r2c.push_back(data);
                self.flush();
                None
            }
            ChannelEvent::Drained => {
                self.flush();
                None
            }
            ChannelEvent::Closed => Some(CloseReason::RelayClosed),
            ChannelEvent::Error(e) => Some(CloseReason::RelayError(e)),
        }
    }

    /// Move queued data in both directions as far as the rate limiter and
    /// the destinations' send buffers allow. If data is still waiting on an
    /// open destination, (re)schedule a single retry; data waiting on a
    /// destination that has not opened yet is flushed by its open event.
    fn flush(&mut self) {
        let mut limiter = match self.ctx.limiter.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let relay_waiting = drain(&mut self.c2r, self.relay.as_ref(), &mut **limiter);
        let client_waiting = drain(&mut self.r2c, self.client.as_ref(), &mut **limiter);

        self.flush_deadline = None;
        if relay_waiting || client_waiting {
            let wait = Duration::from_secs_f64(limiter.when().max(0.0)).max(FLUSH_MIN_DELAY);
            self.flush_deadline = Some(Instant::now() + wait);
        }
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        self.state_tx.send_replace(state);
    }

    /// Release everything the session holds. Runs once; later calls are no-ops.
    async fn shutdown(&mut self, reason: CloseReason) {
        if self.state == SessionState::Closed {
            return;
        }
        match &reason {
            CloseReason::Requested | CloseReason::ClientClosed | CloseReason::Abandoned => {
                debug!(sid = %self.id, ?reason, "closing session")
            }
            _ => info!(sid = %self.id, ?reason, "closing session"),
        }

        self.set_state(SessionState::Closed);
        self.stale_deadline = None;
        self.connect_deadline = None;
        self.flush_deadline = None;
        self.c2r.clear();
        self.r2c.clear();

        if let Some(client) = self.client.take() {
            client.close();
        }
        if let Some(relay) = self.relay.take() {
            relay.close();
        }
        self.peer.close().await;

        if self.counted {
            self.counted = false;
            self.ctx.stats.decrease();
        }
    }
}

/// Send queued messages in FIFO order while `dest` is open, below
/// [`MAX_BUFFER`] and the limiter allows. Returns whether an open
/// destination still has queued or buffered data.
fn drain(
    queue: &mut VecDeque<Bytes>,
    dest: Option<&Arc<dyn DataChannel>>,
    limiter: &mut dyn RateLimit,
) -> bool {
    let Some(dest) = dest.filter(|d| d.is_open()) else {
        return false;
    };

    while dest.buffered_amount() < MAX_BUFFER && !limiter.is_limited() {
        let Some(chunk) = queue.pop_front() else {
            break;
        };
        let len = chunk.len();
        if let Err(e) = dest.send(chunk.clone()) {
            debug!(error = %e, "send failed, keeping message queued");
            queue.push_front(chunk);
            return false;
        }
        limiter.update(len);
    }

    !queue.is_empty() || dest.buffered_amount() > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{harness, offer_json, settle, test_config, Harness};
    use flurry_core::rate_limit::{self, BucketRateLimit};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn offer(open: bool) -> ClientOffer {
        ClientOffer {
            offer: offer_json(open),
            relay_url: None,
            client_nat: Default::default(),
        }
    }

    async fn spawned(h: &Harness, open: bool) -> (SessionHandle, Arc<AtomicUsize>) {
        let mut pair = ProxyPair::new("sid".into(), h.ctx.clone()).await.unwrap();
        pair.receive_offer(&offer(open)).await.unwrap();
        let cleanups = Arc::new(AtomicUsize::new(0));
        let counter = cleanups.clone();
        let handle = pair.spawn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        settle().await;
        (handle, cleanups)
    }

    #[tokio::test(start_paused = true)]
    async fn relay_connect_timeout_closes_session() {
        let h = harness(test_config());
        let (mut handle, cleanups) = spawned(&h, true).await;

        assert_eq!(handle.state(), SessionState::RelayConnecting);
        assert_eq!(h.ctx.stats.active(), 1);

        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert_eq!(handle.state(), SessionState::RelayConnecting);

        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.closed().await;
        settle().await;

        assert_eq!(h.ctx.stats.active(), 0);
        assert!(h.relays.last().channel.is_closed());
        assert!(h.peers.last().is_closed());
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);

        // closing again must not decrement a second time
        handle.close();
        settle().await;
        assert_eq!(h.ctx.stats.active(), 0);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_both_directions_in_order() {
        let h = harness(test_config());
        let (handle, _) = spawned(&h, true).await;
        let peer = h.peers.last();
        let relay = h.relays.last();

        relay.open();
        settle().await;
        assert_eq!(handle.state(), SessionState::Relaying);

        peer.message(b"one");
        peer.message(b"two");
        relay.message(b"three");
        settle().await;

        assert_eq!(relay.channel.sent(), vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]);
        assert_eq!(peer.channel.sent(), vec![Bytes::from_static(b"three")]);
    }

    #[tokio::test(start_paused = true)]
    async fn holds_data_until_relay_opens() {
        let h = harness(test_config());
        let (_handle, _) = spawned(&h, true).await;
        let peer = h.peers.last();
        let relay = h.relays.last();

        peer.message(b"a");
        peer.message(b"b");
        settle().await;
        assert!(relay.channel.sent().is_empty());

        relay.open();
        settle().await;
        assert_eq!(relay.channel.sent(), vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
    }

    #[tokio::test(start_paused = true)]
    async fn pauses_while_destination_buffer_full() {
        let h = harness(test_config());
        let (_handle, _) = spawned(&h, true).await;
        let peer = h.peers.last();
        let relay = h.relays.last();
        relay.open();
        settle().await;

        relay.channel.set_buffered(MAX_BUFFER);
        peer.message(b"queued");
        settle().await;
        assert!(relay.channel.sent().is_empty());

        relay.channel.set_buffered(0);
        tokio::time::sleep(FLUSH_MIN_DELAY * 2).await;
        settle().await;
        assert_eq!(relay.channel.sent(), vec![Bytes::from_static(b"queued")]);
    }

    /// Never limited, but asks for a long retry delay so only events flush.
    struct SlowRetry;

    impl RateLimit for SlowRetry {
        fn update(&mut self, _n: usize) -> bool {
            true
        }

        fn is_limited(&mut self) -> bool {
            false
        }

        fn when(&mut self) -> f64 {
            60.0
        }
    }

    #[tokio::test(start_paused = true)]
    async fn drained_client_resumes_forwarding() {
        let mut h = harness(test_config());
        h.ctx.limiter = rate_limit::shared(SlowRetry);
        let (_handle, _) = spawned(&h, true).await;
        let peer = h.peers.last();
        let relay = h.relays.last();
        relay.open();
        settle().await;

        peer.channel.set_buffered(MAX_BUFFER);
        relay.message(b"held");
        settle().await;
        assert!(peer.channel.sent().is_empty());

        peer.channel.set_buffered(0);
        peer.emit(PeerEvent::Channel(ChannelEvent::Drained));
        settle().await;
        assert_eq!(peer.channel.sent(), vec![Bytes::from_static(b"held")]);
    }

    #[tokio::test(start_paused = true)]
    async fn drained_relay_resumes_forwarding() {
        let mut h = harness(test_config());
        h.ctx.limiter = rate_limit::shared(SlowRetry);
        let (_handle, _) = spawned(&h, true).await;
        let peer = h.peers.last();
        let relay = h.relays.last();
        relay.open();
        settle().await;

        relay.channel.set_buffered(MAX_BUFFER);
        peer.message(b"held");
        settle().await;
        assert!(relay.channel.sent().is_empty());

        relay.channel.set_buffered(0);
        relay.emit(ChannelEvent::Drained);
        settle().await;
        assert_eq!(relay.channel.sent(), vec![Bytes::from_static(b"held")]);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_defers_forwarding() {
        let mut h = harness(test_config());
        // 10 bytes per second
        h.ctx.limiter = rate_limit::shared(BucketRateLimit::new(10.0, 1.0));
        let (_handle, _) = spawned(&h, true).await;
        let peer = h.peers.last();
        let relay = h.relays.last();
        relay.open();
        settle().await;

        peer.message(b"0123456789012345678901234567890"); // 31 bytes
        peer.message(b"next");
        settle().await;
        assert_eq!(relay.channel.sent().len(), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(relay.channel.sent().len(), 1);

        tokio::time::sleep(Duration::from_millis(1200)).await;
        settle().await;
        assert_eq!(relay.channel.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_session_closes_after_message_timeout() {
        let h = harness(test_config());
        let (mut handle, _) = spawned(&h, true).await;
        h.relays.last().open();
        settle().await;

        tokio::time::sleep(Duration::from_secs(20)).await;
        h.peers.last().message(b"ping");
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(handle.state(), SessionState::Relaying);

        tokio::time::sleep(Duration::from_secs(11)).await;
        handle.closed().await;
        assert_eq!(h.ctx.stats.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn answer_sent_once_and_relay_annotated() {
        let h = harness(test_config());
        let (_handle, _) = spawned(&h, true).await;
        h.peers
            .last()
            .emit(PeerEvent::LocalDescription(SessionDescription::answer("v=0 again")));
        settle().await;

        let answers = h.signaling.answers();
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].0, "sid");

        let url = &h.relays.last().url;
        assert_eq!(url.as_str(), "wss://snowflake.torproject.net/?client_ip=203.0.113.9");
    }

    #[tokio::test(start_paused = true)]
    async fn broker_relay_url_is_used() {
        let h = harness(test_config());
        let mut pair = ProxyPair::new("sid".into(), h.ctx.clone()).await.unwrap();
        let mut client_offer = offer(true);
        client_offer.relay_url = Some("wss://02.snowflake.torproject.net/".into());
        pair.receive_offer(&client_offer).await.unwrap();
        let _handle = pair.spawn(|_| {});
        settle().await;

        assert_eq!(
            h.relays.last().url.as_str(),
            "wss://02.snowflake.torproject.net/?client_ip=203.0.113.9"
        );
    }

    #[tokio::test]
    async fn rejects_bad_offers_without_state_change() {
        let h = harness(test_config());
        let mut pair = ProxyPair::new("sid".into(), h.ctx.clone()).await.unwrap();

        let not_offer = ClientOffer {
            offer: SessionDescription::answer("v=0").to_json().unwrap(),
            ..offer(false)
        };
        assert!(matches!(pair.receive_offer(&not_offer).await, Err(FlurryError::InvalidOffer(_))));
        assert_eq!(pair.state(), SessionState::Created);

        let bad_relay = ClientOffer {
            relay_url: Some("wss://relay.evil.example/".into()),
            ..offer(false)
        };
        assert!(matches!(pair.receive_offer(&bad_relay).await, Err(FlurryError::RelayNotAllowed(_))));
        assert_eq!(pair.state(), SessionState::Created);
        assert!(h.peers.last().offers().is_empty());

        pair.receive_offer(&offer(false)).await.unwrap();
        assert_eq!(pair.state(), SessionState::Negotiating);
        pair.abort().await;
        assert!(h.peers.last().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn client_close_ends_session() {
        let h = harness(test_config());
        let (mut handle, cleanups) = spawned(&h, true).await;
        h.relays.last().open();
        settle().await;

        h.peers.last().emit(PeerEvent::Channel(ChannelEvent::Closed));
        handle.closed().await;
        settle().await;
        assert!(h.relays.last().channel.is_closed());
        assert_eq!(h.ctx.stats.active(), 0);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unopened_session_is_not_counted() {
        let h = harness(test_config());
        let (mut handle, _) = spawned(&h, false).await;
        assert_eq!(handle.state(), SessionState::Negotiating);
        assert!(!handle.is_channel_open());

        handle.close();
        handle.closed().await;
        assert_eq!(h.ctx.stats.active(), 0);
        assert!(h.relays.relays().is_empty());
    }
}
