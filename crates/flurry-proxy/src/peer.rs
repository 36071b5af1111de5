//! WebRTC backend for the peer side of a session, built on the `webrtc` crate.
//!
//! Local descriptions are only reported once ICE gathering has completed, so
//! the broker always receives a complete answer (no trickle ICE).

use async_trait::async_trait;
use bytes::Bytes;
use flurry_core::{
    ChannelEvent, DataChannel, FlurryError, FlurryResult, PeerConnection, PeerEvent, PeerFactory,
    SessionDescription,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Upper bound on candidate gathering for locally created offers.
const GATHER_TIMEOUT: Duration = Duration::from_secs(10);

/// SCTP buffered amount at which the channel reports itself drained.
const BUFFERED_LOW: usize = 0;

fn transport(e: webrtc::Error) -> FlurryError {
    FlurryError::Transport(e.to_string())
}

pub struct WebRtcPeerFactory {
    api: API,
    ice_servers: Vec<String>,
}

impl WebRtcPeerFactory {
    pub fn new(ice_servers: &[String]) -> FlurryResult<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(transport)?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(transport)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            ice_servers: ice_servers.to_vec(),
        })
    }
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> FlurryResult<Arc<dyn PeerConnection>> {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await.map_err(transport)?);

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            debug!(?state, "peer connection state");
            if state == RTCPeerConnectionState::Failed {
                let _ = tx.send(PeerEvent::Failed("peer connection failed".into()));
            }
            Box::pin(async {})
        }));

        let tx = events.clone();
        pc.on_data_channel(Box::new(move |dc| {
            debug!(label = dc.label(), "remote data channel");
            wire_channel(dc, tx.clone());
            Box::pin(async {})
        }));

        Ok(Arc::new(WebRtcPeer { pc, events }))
    }
}

struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn accept_offer(&self, offer: &SessionDescription) -> FlurryResult<()> {
        let remote = RTCSessionDescription::offer(offer.sdp.clone())
            .map_err(|e| FlurryError::InvalidOffer(e.to_string()))?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| FlurryError::InvalidOffer(e.to_string()))?;

        let answer = self.pc.create_answer(None).await.map_err(transport)?;
        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(answer).await.map_err(transport)?;

        let pc = self.pc.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let _ = gathered.recv().await;
            let event = match pc.local_description().await {
                Some(desc) => PeerEvent::LocalDescription(SessionDescription::answer(desc.sdp)),
                None => PeerEvent::Failed("no local description after gathering".into()),
            };
            let _ = events.send(event);
        });
        Ok(())
    }

    async fn create_probe_offer(&self, label: &str) -> FlurryResult<SessionDescription> {
        let dc = self
            .pc
            .create_data_channel(label, None)
            .await
            .map_err(transport)?;
        wire_channel(dc, self.events.clone());

        let offer = self.pc.create_offer(None).await.map_err(transport)?;
        let mut gathered = self.pc.gathering_complete_promise().await;
        self.pc.set_local_description(offer).await.map_err(transport)?;
        tokio::time::timeout(GATHER_TIMEOUT, gathered.recv())
            .await
            .map_err(|_| FlurryError::Timeout)?;

        let desc = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| FlurryError::Transport("no local description after gathering".into()))?;
        Ok(SessionDescription::offer(desc.sdp))
    }

    async fn accept_answer(&self, answer: &SessionDescription) -> FlurryResult<()> {
        let remote = RTCSessionDescription::answer(answer.sdp.clone())
            .map_err(|e| FlurryError::InvalidAnswer(e.to_string()))?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| FlurryError::InvalidAnswer(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!(error = %e, "error closing peer connection");
        }
    }
}

enum Outgoing {
    Data(Bytes),
    Close,
}

struct ChannelShared {
    open: AtomicBool,
    /// Bytes handed to [`WebRtcChannel::send`] and not yet passed to SCTP.
    pending: AtomicUsize,
    /// SCTP-level buffered amount as of the last write or drain.
    sctp_buffered: AtomicUsize,
}

/// Non-blocking sending half over an [`RTCDataChannel`]; writes are
/// serialised through a per-channel writer task.
struct WebRtcChannel {
    shared: Arc<ChannelShared>,
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl WebRtcChannel {
    fn spawn(dc: Arc<RTCDataChannel>) -> Arc<Self> {
        let shared = Arc::new(ChannelShared {
            open: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
            sctp_buffered: AtomicUsize::new(0),
        });
        let (tx, mut rx) = mpsc::unbounded_channel();

        let writer = shared.clone();
        tokio::spawn(async move {
            while let Some(out) = rx.recv().await {
                match out {
                    Outgoing::Data(data) => {
                        let len = data.len();
                        let result = dc.send(&data).await;
                        writer.pending.fetch_sub(len, Ordering::SeqCst);
                        writer
                            .sctp_buffered
                            .store(dc.buffered_amount().await, Ordering::SeqCst);
                        if let Err(e) = result {
                            warn!(label = dc.label(), error = %e, "data channel write failed");
                            break;
                        }
                    }
                    Outgoing::Close => break,
                }
            }
            writer.open.store(false, Ordering::SeqCst);
            if let Err(e) = dc.close().await {
                debug!(error = %e, "error closing data channel");
            }
        });

        Arc::new(Self { shared, tx })
    }
}

impl DataChannel for WebRtcChannel {
    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    fn buffered_amount(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst) + self.shared.sctp_buffered.load(Ordering::SeqCst)
    }

    fn send(&self, data: Bytes) -> FlurryResult<()> {
        if !self.is_open() {
            return Err(FlurryError::ChannelClosed);
        }
        let len = data.len();
        self.shared.pending.fetch_add(len, Ordering::SeqCst);
        self.tx.send(Outgoing::Data(data)).map_err(|_| {
            self.shared.pending.fetch_sub(len, Ordering::SeqCst);
            FlurryError::ChannelClosed
        })
    }

    fn close(&self) {
        if self.shared.open.swap(false, Ordering::SeqCst) {
            let _ = self.tx.send(Outgoing::Close);
        }
    }
}

/// Route a data channel's callbacks into the peer's event queue.
fn wire_channel(dc: Arc<RTCDataChannel>, events: mpsc::UnboundedSender<PeerEvent>) {
    let channel = WebRtcChannel::spawn(dc.clone());

    let tx = events.clone();
    let opened = channel.clone();
    dc.on_open(Box::new(move || {
        opened.shared.open.store(true, Ordering::SeqCst);
        let _ = tx.send(PeerEvent::ChannelOpen(opened));
        Box::pin(async {})
    }));

    let tx = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let _ = tx.send(PeerEvent::Channel(ChannelEvent::Message(msg.data)));
        Box::pin(async {})
    }));

    let tx = events.clone();
    let shared = channel.shared.clone();
    let writer = channel.tx.clone();
    dc.on_close(Box::new(move || {
        shared.open.store(false, Ordering::SeqCst);
        let _ = writer.send(Outgoing::Close);
        let _ = tx.send(PeerEvent::Channel(ChannelEvent::Closed));
        Box::pin(async {})
    }));

    let tx = events.clone();
    dc.on_error(Box::new(move |err| {
        let _ = tx.send(PeerEvent::Channel(ChannelEvent::Error(err.to_string())));
        Box::pin(async {})
    }));

    // Writes refresh the SCTP snapshot only while data flows; the drain
    // callback clears it once everything has been sent.
    let shared = channel.shared.clone();
    tokio::spawn(async move {
        dc.set_buffered_amount_low_threshold(BUFFERED_LOW).await;
        dc.on_buffered_amount_low(Box::new(move || {
            shared.sctp_buffered.store(BUFFERED_LOW, Ordering::SeqCst);
            let _ = events.send(PeerEvent::Channel(ChannelEvent::Drained));
            Box::pin(async {})
        }))
        .await;
    });
}
