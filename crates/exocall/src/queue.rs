//! In-process transport backed by tokio mpsc channels.
//!
//! `QueueTransport::pair()` returns the channel's side and a `PeerEnd`. The
//! peer end receives raw payloads and pushes `TransportEvent`s back, so a peer
//! can run in another task (or thread) without any real IPC.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::sync::mpsc;

use crate::transport;
use crate::transport::Transport;
use crate::transport::TransportEvent;

pub struct QueueTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl QueueTransport {
    /// Creates a transport connected to a fresh `PeerEnd`.
    pub fn pair() -> (Self, PeerEnd) {
        let (payload_tx, payload_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let transport = Self {
            tx: payload_tx,
            rx: Arc::new(Mutex::new(event_rx)),
        };
        let peer = PeerEnd {
            rx: payload_rx,
            tx: event_tx,
        };
        (transport, peer)
    }
}

#[async_trait::async_trait]
impl Transport for QueueTransport {
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        self.tx
            .send(payload.to_vec())
            .map_err(|_| transport::Error::ConnectionLost("Peer end dropped".into()))
    }

    async fn recv(&self) -> transport::Result<Option<TransportEvent>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }
}

/// The peer's half of a `QueueTransport`.
pub struct PeerEnd {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl PeerEnd {
    /// Next payload from the channel, or `None` once the channel side is gone.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Returns false if the channel side has been dropped.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    /// A handle for emitting events from elsewhere, e.g. a supervisor
    /// that notices the peer process exiting.
    pub fn sender(&self) -> mpsc::UnboundedSender<TransportEvent> {
        self.tx.clone()
    }

    pub fn ready(&self) -> bool {
        self.emit(TransportEvent::Ready)
    }

    pub fn reply(&self, payload: Vec<u8>) -> bool {
        self.emit(TransportEvent::Message(payload))
    }
}
