//! # Neowire
//!
//! The wire format between a controlling process and its peer.
//!
//! ## Architecture
//!
//! Every commit becomes exactly one `CommitFrame` carrying a correlation id,
//! the batched commands, and the handle ids whose values should come back.
//! The peer answers with one `ReplyFrame` per commit and may interleave
//! `LogFrame`s at any time. Frames are JSON objects with camelCase keys.

mod error;
mod frame;
mod value;


pub use error::Error;
pub use error::Result;
pub use frame::Command;
pub use frame::CommitFrame;
pub use frame::Inbound;
pub use frame::LogFrame;
pub use frame::ReplyFrame;
pub use value::Bytes;
pub use value::Value;
