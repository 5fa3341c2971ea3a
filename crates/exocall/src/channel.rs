//! # Channel with Async Pump
//!
//! A `Channel` owns the connection to one peer. Calls from every `Context`
//! land in a shared batch; `commit` flushes that batch as exactly one
//! `CommitFrame` and registers a callback under a fresh correlation id. The
//! pump task reads transport events and routes replies back to callbacks.
//!
//! ## Invariants
//! - Correlation ids are unique for the channel's lifetime.
//! - Messages sent before the peer is ready are queued and flushed in order.
//! - After a transport error or peer termination every pending callback has
//!   been called with `Error::Terminated`, and new commits fail immediately.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use neotype::TypeRegistry;
use neowire::Command;
use neowire::CommitFrame;
use neowire::Inbound;
use neowire::ReplyFrame;
use neowire::Value;

use crate::batch::Batch;
use crate::context::Context;
use crate::handles;
use crate::handles::ContextId;
use crate::handles::Handle;
use crate::handles::HandleId;
use crate::handles::HandleTable;
use crate::resolve::Resolver;
use crate::transport;
use crate::transport::Transport;
use crate::transport::TransportEvent;

/// A reply that does not fit what was asked for.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    Malformed(neowire::Error),
    /// No pending commit has this correlation id. Duplicates land here too.
    UnknownCorrelation(u64),
    ValueCountMismatch { correlation_id: u64, expected: usize, found: usize },
    NotAHandleId { correlation_id: u64, index: usize, value: String },
    UnknownHandle { correlation_id: u64, index: usize, id: u64 },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "Malformed message: {}", e),
            Self::UnknownCorrelation(id) => write!(f, "No pending commit with correlation id {}", id),
            Self::ValueCountMismatch { correlation_id, expected, found } => write!(
                f,
                "Reply {} carries {} values, expected {}",
                correlation_id, found, expected
            ),
            Self::NotAHandleId { correlation_id, index, value } => write!(
                f,
                "Reply {} value #{} should be a handle id, got {}",
                correlation_id, index, value
            ),
            Self::UnknownHandle { correlation_id, index, id } => write!(
                f,
                "Reply {} value #{} names handle {} which is not live",
                correlation_id, index, id
            ),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    Transport(transport::Error),
    Wire(neowire::Error),
    Protocol(ProtocolError),
    Handle(handles::Error),
    /// The peer is gone. Carries the reason reported by the transport.
    Terminated(String),
    /// The callback was dropped without being called.
    ChannelClosed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Wire(e) => write!(f, "Wire error: {}", e),
            Self::Protocol(e) => write!(f, "Protocol error: {}", e),
            Self::Handle(e) => write!(f, "Handle error: {}", e),
            Self::Terminated(reason) => write!(f, "Peer terminated: {}", reason),
            Self::ChannelClosed => write!(f, "Response channel closed"),
        }
    }
}

impl std::error::Error for Error {}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

impl From<neowire::Error> for Error {
    fn from(e: neowire::Error) -> Self {
        Self::Wire(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<handles::Error> for Error {
    fn from(e: handles::Error) -> Self {
        Self::Handle(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// One value of a reply, after handle ids have been mapped back.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Value(Value),
    Handle(Handle),
}

impl Resolved {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(v) => Some(v),
            Self::Handle(_) => None,
        }
    }

    pub fn as_handle(&self) -> Option<&Handle> {
        match self {
            Self::Handle(h) => Some(h),
            Self::Value(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_value().and_then(Value::as_i64)
    }
}

pub type CommitResult = Result<Vec<Resolved>>;

pub type Callback = Box<dyn FnOnce(CommitResult) + Send + 'static>;

/// Receives the peer's log lines.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

struct PendingCommit {
    outputs: Vec<Handle>,
    // The map is shared with the pump task, so entries must be `Sync`.
    callback: Mutex<Option<Callback>>,
}

impl PendingCommit {
    fn new(outputs: Vec<Handle>, callback: Callback) -> Self {
        Self { outputs, callback: Mutex::new(Some(callback)) }
    }

    fn fire(self, result: CommitResult) {
        let callback = self.callback.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(callback) = callback {
            callback(result);
        }
    }
}

#[derive(Default)]
struct Outbox {
    ready: bool,
    queued: Vec<Vec<u8>>,
    terminated: Option<String>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) struct Inner {
    name: String,
    registry: Arc<TypeRegistry>,
    resolver: Resolver,
    handles: Mutex<HandleTable>,
    batch: Mutex<Batch>,
    pending: DashMap<u64, PendingCommit>,
    next_correlation: AtomicU64,
    next_context: AtomicU64,
    outbox: tokio::sync::Mutex<Outbox>,
    transport: Arc<dyn Transport>,
    log_sink: Option<LogSink>,
}

/// Connection to one peer. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

impl Channel {
    pub(crate) fn new(
        name: String,
        registry: Arc<TypeRegistry>,
        resolver: Resolver,
        transport: Arc<dyn Transport>,
        log_sink: Option<LogSink>,
        ready: bool,
    ) -> Self {
        let inner = Inner {
            name,
            registry,
            resolver,
            handles: Mutex::new(HandleTable::new()),
            batch: Mutex::new(Batch::new()),
            pending: DashMap::new(),
            next_correlation: AtomicU64::new(1),
            next_context: AtomicU64::new(1),
            outbox: tokio::sync::Mutex::new(Outbox { ready, ..Outbox::default() }),
            transport,
            log_sink,
        };
        Self { inner: Arc::new(inner) }
    }

    /// The channel name, used for logging and diagnostics.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.inner.registry
    }

    pub fn resolver(&self) -> &Resolver {
        &self.inner.resolver
    }

    /// A fresh scope for calls and handles.
    pub fn context(&self) -> Context {
        let id = ContextId(self.inner.next_context.fetch_add(1, Ordering::Relaxed));
        Context::new(self.clone(), id)
    }

    pub(crate) fn handles(&self) -> MutexGuard<'_, HandleTable> {
        lock(&self.inner.handles)
    }

    pub(crate) fn push_command(&self, command: Command) {
        lock(&self.inner.batch).push(command);
    }

    /// Commands enqueued since the last commit.
    pub fn batch_len(&self) -> usize {
        lock(&self.inner.batch).len()
    }

    pub fn live_handles(&self) -> usize {
        self.handles().len()
    }

    /// Commits whose reply has not arrived yet.
    pub fn pending_commits(&self) -> usize {
        self.inner.pending.len()
    }

    /// Messages waiting for the peer to become ready.
    pub async fn queued_messages(&self) -> usize {
        self.inner.outbox.lock().await.queued.len()
    }

    pub async fn is_ready(&self) -> bool {
        self.inner.outbox.lock().await.ready
    }

    pub async fn is_terminated(&self) -> bool {
        self.inner.outbox.lock().await.terminated.is_some()
    }

    /// Sends everything batched so far as one message.
    ///
    /// `callback` is called exactly once: with the values of `outputs` in
    /// order, or with the error that ended the commit. An empty batch still
    /// produces a message. Returns the correlation id.
    ///
    /// If this returns `Err`, the callback has been dropped without a call
    /// and the batch is left as it was, except after a failed send.
    pub async fn commit(
        &self,
        outputs: &[Handle],
        callback: impl FnOnce(CommitResult) + Send + 'static,
    ) -> Result<u64> {
        // Holding the outbox across the send keeps the wire order equal to
        // the correlation order.
        let mut outbox = self.inner.outbox.lock().await;
        if let Some(reason) = &outbox.terminated {
            return Err(Error::Terminated(reason.clone()));
        }
        {
            let handles = self.handles();
            if let Some(dead) = outputs.iter().find(|h| !handles.is_live(h.id())) {
                return Err(handles::Error::UnknownHandle(dead.id()).into());
            }
        }

        let correlation_id = self.inner.next_correlation.fetch_add(1, Ordering::Relaxed);
        let frame = CommitFrame {
            correlation_id,
            commands: lock(&self.inner.batch).take(),
            output_handle_ids: outputs.iter().map(Handle::id).collect(),
        };
        let payload = frame.encode()?;
        debug!(
            channel = %self.inner.name,
            correlation_id,
            commands = frame.commands.len(),
            outputs = outputs.len(),
            queued = !outbox.ready,
            "commit"
        );

        self.inner
            .pending
            .insert(correlation_id, PendingCommit::new(outputs.to_vec(), Box::new(callback)));

        if outbox.ready {
            if let Err(e) = self.inner.transport.send(&payload).await {
                self.inner.pending.remove(&correlation_id);
                return Err(e.into());
            }
        } else {
            outbox.queued.push(payload);
        }
        Ok(correlation_id)
    }

    /// `commit`, resolved through a oneshot.
    pub async fn commit_await(&self, outputs: &[Handle]) -> CommitResult {
        let (tx, rx) = oneshot::channel();
        self.commit(outputs, move |result| {
            let _ = tx.send(result);
        })
        .await?;
        rx.await.map_err(|_| Error::ChannelClosed)?
    }

    /// The peer finished loading. Flushes queued messages in order.
    pub async fn on_ready(&self) -> Result<()> {
        let mut outbox = self.inner.outbox.lock().await;
        if outbox.ready || outbox.terminated.is_some() {
            return Ok(());
        }
        outbox.ready = true;
        let queued = std::mem::take(&mut outbox.queued);
        info!(channel = %self.inner.name, queued = queued.len(), "peer ready");

        for payload in queued {
            if let Err(e) = self.inner.transport.send(&payload).await {
                drop(outbox);
                self.terminate(format!("send failed while flushing: {}", e)).await;
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Routes one inbound message. Log lines go to the sink; replies go to
    /// their callback. Errors here are reported, never fatal to the channel.
    pub fn on_message(&self, payload: &[u8]) -> Result<()> {
        let inbound = Inbound::decode(payload).map_err(ProtocolError::Malformed)?;
        match inbound {
            Inbound::Log(log) => {
                match &self.inner.log_sink {
                    Some(sink) => sink(&log.msg),
                    None => info!(channel = %self.inner.name, "{}", log.msg),
                }
                Ok(())
            }
            Inbound::Reply(reply) => self.complete(reply),
        }
    }

    fn complete(&self, reply: ReplyFrame) -> Result<()> {
        let Some((_, pending)) = self.inner.pending.remove(&reply.correlation_id) else {
            warn!(channel = %self.inner.name, correlation_id = reply.correlation_id, "reply without pending commit");
            return Err(ProtocolError::UnknownCorrelation(reply.correlation_id).into());
        };

        match self.demux(&reply, &pending.outputs) {
            Ok(values) => {
                pending.fire(Ok(values));
                Ok(())
            }
            Err(e) => {
                pending.fire(Err(e.clone()));
                Err(e)
            }
        }
    }

    /// Maps reply values back: primitives and host values pass through,
    /// numeric ids of every other output become the live handle with that id.
    fn demux(&self, reply: &ReplyFrame, outputs: &[Handle]) -> Result<Vec<Resolved>> {
        let correlation_id = reply.correlation_id;
        if reply.values.len() != outputs.len() {
            return Err(ProtocolError::ValueCountMismatch {
                correlation_id,
                expected: outputs.len(),
                found: reply.values.len(),
            }
            .into());
        }

        let handles = self.handles();
        let mut resolved = Vec::with_capacity(outputs.len());
        for (index, (value, output)) in reply.values.iter().zip(outputs).enumerate() {
            if output.ty().is_primitive() {
                resolved.push(Resolved::Value(value.clone()));
                continue;
            }
            // Host values (strings, arrays, ...) come back by value.
            if output.ty().is_opaque() {
                resolved.push(Resolved::Value(value.clone()));
                continue;
            }
            let Some(id) = value.as_u64() else {
                return Err(ProtocolError::NotAHandleId { correlation_id, index, value: value.to_string() }.into());
            };
            let handle = HandleId::try_from(id).ok().and_then(|id| handles.lookup(id));
            let Some(handle) = handle else {
                return Err(ProtocolError::UnknownHandle { correlation_id, index, id }.into());
            };
            resolved.push(Resolved::Handle(handle.clone()));
        }
        Ok(resolved)
    }

    pub async fn on_transport_error(&self, info: &str) {
        self.terminate(format!("transport error: {}", info)).await;
    }

    pub async fn on_peer_terminated(&self, info: &str) {
        self.terminate(format!("peer terminated: {}", info)).await;
    }

    async fn terminate(&self, reason: String) {
        {
            let mut outbox = self.inner.outbox.lock().await;
            if outbox.terminated.is_some() {
                return;
            }
            error!(channel = %self.inner.name, queued = outbox.queued.len(), "{}", reason);
            outbox.queued.clear();
            outbox.terminated = Some(reason.clone());
        }
        self.fail_pending(Error::Terminated(reason));
    }

    /// Notify all pending commits with the given error.
    fn fail_pending(&self, error: Error) {
        let keys: Vec<u64> = self.inner.pending.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, pending)) = self.inner.pending.remove(&key) {
                pending.fire(Err(error.clone()));
            }
        }
    }

    /// Spawns the task that feeds transport events into this channel.
    /// It ends once the transport reports an error or termination.
    pub fn spawn_pump(&self) -> tokio::task::JoinHandle<()> {
        let channel = self.clone();
        tokio::spawn(async move {
            loop {
                match channel.inner.transport.recv().await {
                    Ok(Some(TransportEvent::Ready)) => {
                        if let Err(e) = channel.on_ready().await {
                            warn!(channel = %channel.name(), "flush failed: {}", e);
                        }
                    }
                    Ok(Some(TransportEvent::Message(payload))) => {
                        if let Err(e) = channel.on_message(&payload) {
                            warn!(channel = %channel.name(), "{}", e);
                        }
                    }
                    Ok(Some(TransportEvent::Error(info))) => {
                        channel.on_transport_error(&info).await;
                        break;
                    }
                    Ok(Some(TransportEvent::Terminated(info))) => {
                        channel.on_peer_terminated(&info).await;
                        break;
                    }
                    Ok(None) => {
                        channel.on_peer_terminated("stream closed").await;
                        break;
                    }
                    Err(e) => {
                        channel.on_transport_error(&e.to_string()).await;
                        break;
                    }
                }
            }
        })
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.inner.name)
            .field("pending", &self.inner.pending.len())
            .finish_non_exhaustive()
    }
}
