//! In-memory transports and signaling used by the session, NAT probe and
//! orchestrator tests.

use crate::broker::{ClientOffer, PollOutcome, Signaling};
use crate::config::ProxyConfig;
use crate::context::ProxyContext;
use crate::report::{Reporter, StatusReport};
use async_trait::async_trait;
use bytes::Bytes;
use flurry_core::{
    ChannelEvent, DataChannel, FlurryError, FlurryResult, NatType, PeerConnection, PeerEvent,
    PeerFactory, RelayDialer, SessionDescription,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Instant;
use url::Url;

/// Offers carrying this attribute make the mock peer open its data channel
/// as soon as the offer is applied.
pub const OPEN_MARKER: &str = "a=x-mock-open";

pub fn offer_json(open: bool) -> String {
    let mut sdp = String::from("v=0\r\nc=IN IP4 203.0.113.9\r\n");
    if open {
        sdp.push_str(OPEN_MARKER);
        sdp.push_str("\r\n");
    }
    SessionDescription::offer(sdp).to_json().unwrap()
}

pub fn test_config() -> ProxyConfig {
    ProxyConfig {
        nat_probe: false,
        ..ProxyConfig::default()
    }
}

/// Yield enough times for spawned tasks and the session loops to catch up.
pub async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

pub struct MockChannel {
    open: AtomicBool,
    closed: AtomicBool,
    buffered: AtomicUsize,
    sent: Mutex<Vec<Bytes>>,
}

impl MockChannel {
    pub fn new(open: bool) -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(open),
            closed: AtomicBool::new(false),
            buffered: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn set_buffered(&self, n: usize) {
        self.buffered.store(n, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl DataChannel for MockChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.is_closed()
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn send(&self, data: Bytes) -> FlurryResult<()> {
        if !self.is_open() {
            return Err(FlurryError::ChannelClosed);
        }
        self.sent.lock().unwrap().push(data);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct MockPeer {
    events: mpsc::UnboundedSender<PeerEvent>,
    pub channel: Arc<MockChannel>,
    offers: Mutex<Vec<SessionDescription>>,
    closed: AtomicBool,
    probe_opens: bool,
}

impl MockPeer {
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    pub fn open_channel(&self) {
        self.channel.set_open(true);
        self.emit(PeerEvent::ChannelOpen(self.channel.clone()));
    }

    pub fn message(&self, data: &'static [u8]) {
        self.emit(PeerEvent::Channel(ChannelEvent::Message(Bytes::from_static(data))));
    }

    pub fn offers(&self) -> Vec<SessionDescription> {
        self.offers.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn accept_offer(&self, offer: &SessionDescription) -> FlurryResult<()> {
        self.offers.lock().unwrap().push(offer.clone());
        self.emit(PeerEvent::LocalDescription(SessionDescription::answer("v=0 mock")));
        if offer.sdp.contains(OPEN_MARKER) {
            self.open_channel();
        }
        Ok(())
    }

    async fn create_probe_offer(&self, _label: &str) -> FlurryResult<SessionDescription> {
        Ok(SessionDescription::offer("v=0 probe"))
    }

    async fn accept_answer(&self, _answer: &SessionDescription) -> FlurryResult<()> {
        if self.probe_opens {
            self.open_channel();
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.channel.close();
    }
}

#[derive(Default)]
pub struct MockPeerFactory {
    peers: Mutex<Vec<Arc<MockPeer>>>,
    pub probe_opens: AtomicBool,
    pub fail: AtomicBool,
}

impl MockPeerFactory {
    pub fn peers(&self) -> Vec<Arc<MockPeer>> {
        self.peers.lock().unwrap().clone()
    }

    pub fn last(&self) -> Arc<MockPeer> {
        self.peers.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl PeerFactory for MockPeerFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> FlurryResult<Arc<dyn PeerConnection>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(FlurryError::Transport("webrtc unavailable".into()));
        }
        let peer = Arc::new(MockPeer {
            events,
            channel: MockChannel::new(false),
            offers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            probe_opens: self.probe_opens.load(Ordering::SeqCst),
        });
        self.peers.lock().unwrap().push(peer.clone());
        Ok(peer)
    }
}

pub struct MockRelay {
    pub url: Url,
    pub channel: Arc<MockChannel>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl MockRelay {
    pub fn open(&self) {
        self.channel.set_open(true);
        self.emit(ChannelEvent::Open);
    }

    pub fn message(&self, data: &'static [u8]) {
        self.emit(ChannelEvent::Message(Bytes::from_static(data)));
    }

    pub fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }
}

#[derive(Default)]
pub struct MockRelayDialer {
    relays: Mutex<Vec<Arc<MockRelay>>>,
    pub auto_open: AtomicBool,
}

impl MockRelayDialer {
    pub fn relays(&self) -> Vec<Arc<MockRelay>> {
        self.relays.lock().unwrap().clone()
    }

    pub fn last(&self) -> Arc<MockRelay> {
        self.relays.lock().unwrap().last().cloned().unwrap()
    }
}

impl RelayDialer for MockRelayDialer {
    fn dial(&self, url: &Url, events: mpsc::UnboundedSender<ChannelEvent>) -> Arc<dyn DataChannel> {
        let relay = Arc::new(MockRelay {
            url: url.clone(),
            channel: MockChannel::new(false),
            events,
        });
        if self.auto_open.load(Ordering::SeqCst) {
            relay.open();
        }
        self.relays.lock().unwrap().push(relay.clone());
        relay.channel.clone()
    }
}

#[derive(Debug, Clone)]
pub struct RecordedPoll {
    pub sid: String,
    pub clients: usize,
    pub nat: NatType,
    pub at: Instant,
}

#[derive(Default)]
pub struct MockSignaling {
    outcomes: Mutex<VecDeque<FlurryResult<PollOutcome>>>,
    polls: Mutex<Vec<RecordedPoll>>,
    answers: Mutex<Vec<(String, SessionDescription)>>,
    pub probe_fails: AtomicBool,
    pub probes: AtomicUsize,
}

impl MockSignaling {
    pub fn push_outcome(&self, outcome: FlurryResult<PollOutcome>) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    /// Queue a client match whose data channel opens (or not).
    pub fn push_match(&self, open: bool, client_nat: NatType) {
        self.push_outcome(Ok(PollOutcome::Match(ClientOffer {
            offer: offer_json(open),
            relay_url: None,
            client_nat,
        })));
    }

    pub fn polls(&self) -> Vec<RecordedPoll> {
        self.polls.lock().unwrap().clone()
    }

    pub fn answers(&self) -> Vec<(String, SessionDescription)> {
        self.answers.lock().unwrap().clone()
    }
}

#[async_trait]
impl Signaling for MockSignaling {
    async fn get_offer(
        &self,
        sid: &str,
        active_clients: usize,
        nat: NatType,
    ) -> FlurryResult<PollOutcome> {
        self.polls.lock().unwrap().push(RecordedPoll {
            sid: sid.to_string(),
            clients: active_clients,
            nat,
            at: Instant::now(),
        });
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(PollOutcome::NoMatch))
    }

    async fn send_answer(&self, sid: &str, answer: &SessionDescription) {
        self.answers
            .lock()
            .unwrap()
            .push((sid.to_string(), answer.clone()));
    }

    async fn probe(&self, _offer: &SessionDescription) -> FlurryResult<SessionDescription> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.probe_fails.load(Ordering::SeqCst) {
            return Err(FlurryError::Broker("probe endpoint unreachable".into()));
        }
        Ok(SessionDescription::answer("v=0 probe"))
    }
}

#[derive(Default)]
pub struct MockReporter {
    reports: Mutex<Vec<StatusReport>>,
}

impl MockReporter {
    pub fn reports(&self) -> Vec<StatusReport> {
        self.reports.lock().unwrap().clone()
    }
}

impl Reporter for MockReporter {
    fn report(&self, status: &StatusReport) {
        self.reports.lock().unwrap().push(status.clone());
    }
}

pub struct Harness {
    pub ctx: ProxyContext,
    pub signaling: Arc<MockSignaling>,
    pub peers: Arc<MockPeerFactory>,
    pub relays: Arc<MockRelayDialer>,
    pub reporter: Arc<MockReporter>,
}

pub fn harness(config: ProxyConfig) -> Harness {
    let signaling = Arc::new(MockSignaling::default());
    let peers = Arc::new(MockPeerFactory::default());
    let relays = Arc::new(MockRelayDialer::default());
    let reporter = Arc::new(MockReporter::default());
    let ctx = ProxyContext::new(
        config,
        signaling.clone(),
        peers.clone(),
        relays.clone(),
        reporter.clone(),
    );
    Harness {
        ctx,
        signaling,
        peers,
        relays,
        reporter,
    }
}
