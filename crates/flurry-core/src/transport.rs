//! Abstract transport traits for the relay engine.
//!
//! The session state machine never touches WebRTC or WebSocket types
//! directly: the peer side is a [`PeerConnection`] produced by a
//! [`PeerFactory`], the relay side is a [`DataChannel`] produced by a
//! [`RelayDialer`]. Both report lifecycle and data through event channels.

use crate::error::FlurryResult;
use crate::messages::SessionDescription;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use url::Url;

/// An ordered, message-oriented byte channel with send-side buffering.
///
/// All methods are non-blocking so the flush loop can call them while
/// holding the shared rate limiter.
pub trait DataChannel: Send + Sync {
    /// Whether the channel is open for sending.
    fn is_open(&self) -> bool;

    /// Bytes accepted by [`send`](Self::send) but not yet handed to the network.
    fn buffered_amount(&self) -> usize;

    /// Queue one message for sending.
    fn send(&self, data: Bytes) -> FlurryResult<()>;

    /// Close the channel. Safe to call more than once.
    fn close(&self);
}

/// Lifecycle and data notifications from a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(Bytes),
    /// The send buffer emptied; sending may resume.
    Drained,
    Closed,
    Error(String),
}

/// Notifications from a peer connection.
pub enum PeerEvent {
    /// Candidate gathering finished; this is the complete local description.
    LocalDescription(SessionDescription),
    /// The remote (or probe-local) data channel reached the open state.
    ChannelOpen(Arc<dyn DataChannel>),
    /// Message, close, or error on the open data channel.
    Channel(ChannelEvent),
    /// The peer connection itself failed.
    Failed(String),
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::LocalDescription(d) => f.debug_tuple("LocalDescription").field(&d.sdp_type).finish(),
            PeerEvent::ChannelOpen(_) => f.write_str("ChannelOpen"),
            PeerEvent::Channel(ev) => f.debug_tuple("Channel").field(ev).finish(),
            PeerEvent::Failed(reason) => f.debug_tuple("Failed").field(reason).finish(),
        }
    }
}

/// A negotiated peer-to-peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Apply a remote offer, create and apply the answer, and start
    /// gathering. Completion is reported as [`PeerEvent::LocalDescription`].
    async fn accept_offer(&self, offer: &SessionDescription) -> FlurryResult<()>;

    /// Open a local data channel and return the fully gathered local offer.
    /// Used by the NAT self-test.
    async fn create_probe_offer(&self, label: &str) -> FlurryResult<SessionDescription>;

    /// Apply the remote answer to a locally created offer.
    async fn accept_answer(&self, answer: &SessionDescription) -> FlurryResult<()>;

    /// Tear down the connection and any data channels on it.
    async fn close(&self);
}

/// Creates peer connections configured with the proxy's ICE servers.
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> FlurryResult<Arc<dyn PeerConnection>>;
}

/// Opens byte-stream connections to the relay.
///
/// `dial` returns immediately; [`ChannelEvent::Open`] arrives on `events`
/// once the connection is established.
pub trait RelayDialer: Send + Sync {
    fn dial(&self, url: &Url, events: mpsc::UnboundedSender<ChannelEvent>) -> Arc<dyn DataChannel>;
}
