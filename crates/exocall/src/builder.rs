//! # Channel Builder
//!
//! Provides a fluent API for configuring a channel before it talks to a peer.

use std::sync::Arc;

use neotype::Builtins;
use neotype::RegistrationError;
use neotype::TypeRegistry;

use crate::channel::Channel;
use crate::channel::LogSink;
use crate::resolve::Resolver;
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    MissingRegistry,
    MissingTransport,
    /// The registry lacks the builtin types calls are inferred against.
    Registry(RegistrationError),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingRegistry => write!(f, "No type registry configured"),
            Self::MissingTransport => write!(f, "No transport configured"),
            Self::Registry(e) => write!(f, "Registry error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<RegistrationError> for Error {
    fn from(e: RegistrationError) -> Self {
        Self::Registry(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Fluent builder for a `Channel`.
pub struct ChannelBuilder {
    name: String,
    registry: Option<Arc<TypeRegistry>>,
    transport: Option<Arc<dyn Transport>>,
    log_sink: Option<LogSink>,
    ready: bool,
}

impl Default for ChannelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelBuilder {
    pub fn new() -> Self {
        Self {
            name: "peer".into(),
            registry: None,
            transport: None,
            log_sink: None,
            ready: false,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn registry(mut self, registry: impl Into<Arc<TypeRegistry>>) -> Self {
        self.registry = Some(registry.into());
        self
    }

    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    pub fn shared_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Where the peer's log lines go. Defaults to `tracing::info!`.
    pub fn log_sink(mut self, sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.log_sink = Some(Arc::new(sink));
        self
    }

    /// Whether the peer is already accepting messages. Defaults to false,
    /// in which case commits queue until `on_ready`.
    pub fn ready(mut self, ready: bool) -> Self {
        self.ready = ready;
        self
    }

    pub fn build(self) -> Result<Channel> {
        let registry = self.registry.ok_or(Error::MissingRegistry)?;
        let transport = self.transport.ok_or(Error::MissingTransport)?;
        let resolver = Resolver::new(Builtins::from_registry(&registry)?);
        Ok(Channel::new(self.name, registry, resolver, transport, self.log_sink, self.ready))
    }
}
