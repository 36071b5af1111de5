//! WebSocket connections to the relay.
//!
//! [`WebSocketDialer::dial`] returns a [`RelayChannel`] straight away and
//! connects in the background. Outgoing messages go through an unbounded
//! queue drained by the connection task; the queued byte count is what the
//! session sees as the channel's buffered amount.

use bytes::Bytes;
use flurry_core::{ChannelEvent, DataChannel, FlurryError, FlurryResult, RelayDialer};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketDialer;

impl WebSocketDialer {
    pub fn new() -> Self {
        Self
    }
}

impl RelayDialer for WebSocketDialer {
    fn dial(&self, url: &Url, events: mpsc::UnboundedSender<ChannelEvent>) -> Arc<dyn DataChannel> {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());

        tokio::spawn(run_connection(url.clone(), shared.clone(), rx, events));

        Arc::new(RelayChannel { shared, tx })
    }
}

#[derive(Default)]
struct Shared {
    open: AtomicBool,
    closed: AtomicBool,
    /// Bytes queued but not yet written to the socket.
    pending: AtomicUsize,
    close: Notify,
}

/// Sending half of a relay connection.
pub struct RelayChannel {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Bytes>,
}

impl DataChannel for RelayChannel {
    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    fn buffered_amount(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    fn send(&self, data: Bytes) -> FlurryResult<()> {
        if !self.is_open() {
            return Err(FlurryError::ChannelClosed);
        }
        let len = data.len();
        self.shared.pending.fetch_add(len, Ordering::SeqCst);
        self.tx.send(data).map_err(|_| {
            self.shared.pending.fetch_sub(len, Ordering::SeqCst);
            FlurryError::ChannelClosed
        })
    }

    fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            self.shared.open.store(false, Ordering::SeqCst);
            self.shared.close.notify_one();
        }
    }
}

async fn run_connection(
    url: Url,
    shared: Arc<Shared>,
    mut outgoing: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedSender<ChannelEvent>,
) {
    let connected = tokio::select! {
        result = connect_async(url.as_str()) => result,
        _ = shared.close.notified() => return,
    };
    let ws = match connected {
        Ok((ws, _response)) => ws,
        Err(e) => {
            warn!(relay = %url, error = %e, "relay connection failed");
            let _ = events.send(ChannelEvent::Error(format!("relay connect error: {e}")));
            return;
        }
    };
    if shared.closed.load(Ordering::SeqCst) {
        return;
    }

    debug!(relay = %url, "relay connected");
    shared.open.store(true, Ordering::SeqCst);
    let _ = events.send(ChannelEvent::Open);

    let (mut sink, mut stream) = ws.split();
    let ended = loop {
        tokio::select! {
            _ = shared.close.notified() => {
                let _ = sink.send(Message::Close(None)).await;
                break None;
            }
            Some(data) = outgoing.recv() => {
                let len = data.len();
                let result = sink.send(Message::Binary(data.to_vec())).await;
                shared.pending.fetch_sub(len, Ordering::SeqCst);
                if let Err(e) = result {
                    break Some(ChannelEvent::Error(format!("relay write error: {e}")));
                }
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    let _ = events.send(ChannelEvent::Message(Bytes::from(data)));
                }
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(ChannelEvent::Message(Bytes::from(text.into_bytes())));
                }
                Some(Ok(Message::Close(_))) | None => break Some(ChannelEvent::Closed),
                Some(Ok(_)) => {}
                Some(Err(e)) => break Some(ChannelEvent::Error(format!("relay read error: {e}"))),
            }
        }
    };

    shared.open.store(false, Ordering::SeqCst);
    if let Some(event) = ended {
        if !shared.closed.load(Ordering::SeqCst) {
            debug!(relay = %url, ?event, "relay connection ended");
            let _ = events.send(event);
        }
    }
}
