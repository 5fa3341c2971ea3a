//! # Error Definitions
//!
//! Failures while encoding or decoding wire messages.

/// Operational failures within the wire layer itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The underlying JSON serialization failed.
    Serialization(String),
    /// The message parsed but does not have the shape of a frame.
    ProtocolViolation(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(msg) => write!(f, "serialization failed: {}", msg),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self { Self::Serialization(e.to_string()) }
}

/// A specialized Result type for wire operations.
pub type Result<T> = std::result::Result<T, Error>;
