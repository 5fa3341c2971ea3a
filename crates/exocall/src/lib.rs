//! # Exocall
//!
//! Batched, type-checked calls into a native module running in another
//! process. Calls are resolved against a `neotype::TypeRegistry`, queued on
//! a `Channel`, and sent as one message per commit. Results come back as
//! handles to values that stay on the peer's side until released.

pub mod batch;
pub mod builder;
pub mod channel;
pub mod context;
pub mod handles;
pub mod queue;
pub mod resolve;
pub mod transport;

#[cfg(test)]
mod tests;

pub use builder::ChannelBuilder;
pub use channel::Channel;
pub use channel::CommitResult;
pub use channel::Resolved;
pub use context::CallError;
pub use context::Context;
pub use context::FinalizerError;
pub use handles::Handle;
pub use handles::HandleId;
pub use handles::Release;
pub use resolve::Arg;
pub use transport::Transport;
pub use transport::TransportEvent;
