//! # Transport Abstraction
//!
//! A minimal, async interface for moving bytes between a channel and its peer.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: The Transport knows nothing about frames, handles, or types.
//!   It moves opaque buffers.
//! - **Event Stream**: Besides messages, the receiving side reports lifecycle
//!   events (ready, error, terminated). The channel reacts to each one.

use std::fmt;

/// Errors that occur at the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The peer is unreachable or the connection was dropped.
    ConnectionLost(String),
    /// The peer rejected the payload size.
    PayloadTooLarge,
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::PayloadTooLarge => write!(f, "Payload too large for transport"),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Something the peer side of a transport reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The peer finished loading and accepts messages.
    Ready,
    Message(Vec<u8>),
    /// The transport failed; carries a human-readable description.
    Error(String),
    /// The peer process went away.
    Terminated(String),
}

/// A mechanism to send byte buffers to a peer and receive its events.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Delivers one payload, in order, to the peer.
    ///
    /// # invariants
    /// - Should not interpret the payload content.
    /// - Payloads sent in sequence must arrive in sequence.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Waits for the next event. `Ok(None)` means the stream closed.
    async fn recv(&self) -> Result<Option<TransportEvent>>;
}
