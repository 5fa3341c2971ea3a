//! # Context
//!
//! A `Context` is a scope for calls. Every handle it creates is released,
//! finalizers first, when the context is destroyed.
//!
//! Calls are type-checked and batched immediately but nothing is sent until
//! the channel commits. The handle a call returns is valid as an argument to
//! later calls in the same batch.

use std::fmt;

use tracing::debug;
use tracing::trace;
use tracing::warn;

use neotype::FunctionSignature;
use neotype::TypeRef;

use crate::batch;
use crate::channel::Channel;
use crate::channel::CommitResult;
use crate::handles;
use crate::handles::ContextId;
use crate::handles::Finalizer;
use crate::handles::Handle;
use crate::handles::HandleId;
use crate::handles::Release;
use crate::resolve::Arg;
use crate::resolve::OverloadError;

#[derive(Debug, Clone, PartialEq)]
pub enum CallError {
    UnknownFunction(String),
    Overload(OverloadError),
    Handle(handles::Error),
    /// The call returns void where a value was needed.
    VoidResult(String),
    NotAStructPointer(String),
    UnknownField { ty: String, field: String },
    /// None of the accessor overloads takes the given slot type.
    NoAccessor { function: String, ty: String },
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownFunction(name) => write!(f, "Unknown function '{}'", name),
            Self::Overload(e) => write!(f, "{}", e),
            Self::Handle(e) => write!(f, "{}", e),
            Self::VoidResult(name) => write!(f, "'{}' returns void", name),
            Self::NotAStructPointer(ty) => write!(f, "{} is not a pointer to a struct", ty),
            Self::UnknownField { ty, field } => write!(f, "{} has no field '{}'", ty, field),
            Self::NoAccessor { function, ty } => write!(f, "No '{}' overload takes {}", function, ty),
        }
    }
}

impl std::error::Error for CallError {}

impl From<OverloadError> for CallError {
    fn from(e: OverloadError) -> Self {
        Self::Overload(e)
    }
}

impl From<handles::Error> for CallError {
    fn from(e: handles::Error) -> Self {
        Self::Handle(e)
    }
}

/// Finalizers that failed during a release. Every finalizer was attempted
/// and every handle was released regardless.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizerError {
    pub failures: Vec<(HandleId, String)>,
}

impl fmt::Display for FinalizerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} finalizer(s) failed", self.failures.len())?;
        for (id, reason) in &self.failures {
            write!(f, "\n  handle {}: {}", id, reason)?;
        }
        Ok(())
    }
}

impl std::error::Error for FinalizerError {}

/// Rounds `destroy` makes before giving up on finalizers that keep
/// allocating new finalized handles.
pub const TEARDOWN_PASSES: usize = 16;

pub struct Context {
    channel: Channel,
    id: ContextId,
    owned: Vec<HandleId>,
}

impl Context {
    pub(crate) fn new(channel: Channel, id: ContextId) -> Self {
        Self { channel, id, owned: Vec::new() }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Ids of the live handles this context created, oldest first.
    pub fn owned(&self) -> &[HandleId] {
        &self.owned
    }

    /// Names of the functions callable through this context.
    pub fn functions(&self) -> Vec<String> {
        self.channel.registry().functions().map(|set| set.name.clone()).collect()
    }

    /// Resolves `name` against `args` and enqueues the call.
    ///
    /// Returns the handle for the result, or `None` for void functions.
    pub fn call(&mut self, name: &str, args: &[Arg]) -> Result<Option<Handle>, CallError> {
        let registry = self.channel.registry().clone();
        let set = registry
            .function(name)
            .ok_or_else(|| CallError::UnknownFunction(name.into()))?;
        self.check_live(args)?;
        let sig = self.channel.resolver().resolve(set, args).map_err(|e| {
            debug!(context = %self.id, "{}", e);
            e
        })?;
        Ok(self.enqueue(sig, args))
    }

    /// Enqueues a call to one specific signature.
    pub fn call_signature(&mut self, sig: &FunctionSignature, args: &[Arg]) -> Result<Option<Handle>, CallError> {
        self.check_live(args)?;
        self.channel.resolver().check(sig, args).map_err(|reason| OverloadError {
            name: sig.name.clone(),
            args: args.iter().map(Arg::to_string).collect(),
            candidates: vec![(sig.to_string(), reason)],
        })?;
        Ok(self.enqueue(sig, args))
    }

    fn check_live(&self, args: &[Arg]) -> Result<(), handles::Error> {
        let handles = self.channel.handles();
        for arg in args {
            if let Arg::Handle(h) = arg {
                if !handles.is_live(h.id()) {
                    return Err(handles::Error::UnknownHandle(h.id()));
                }
            }
        }
        Ok(())
    }

    fn enqueue(&mut self, sig: &FunctionSignature, args: &[Arg]) -> Option<Handle> {
        let result = (!sig.returns_void()).then(|| self.allocate(sig.ret.clone()));
        let command = batch::call_command(sig, args, result.as_ref().map_or(0, Handle::id));
        trace!(context = %self.id, call = %sig, result = command.result_handle_id, "enqueue");
        self.channel.push_command(command);
        result
    }

    /// Registers a new handle of type `ty`, owned by this context.
    pub fn allocate(&mut self, ty: TypeRef) -> Handle {
        let handle = self.channel.handles().allocate(self.id, ty);
        self.owned.push(handle.id());
        handle
    }

    /// Same remote value, new type. No new id is allocated.
    pub fn cast(&self, handle: &Handle, ty: TypeRef) -> Result<Handle, CallError> {
        Ok(self.channel.handles().cast(handle, ty)?)
    }

    pub fn set_finalizer(&self, handle: &Handle, release: Release) -> Result<(), CallError> {
        Ok(self.channel.handles().set_finalizer(handle, release)?)
    }

    /// `malloc(size)`, freed when this context releases the handle.
    pub fn malloc_scoped(&mut self, size: u32) -> Result<Handle, CallError> {
        let handle = self
            .call("malloc", &[Arg::from(size)])?
            .ok_or_else(|| CallError::VoidResult("malloc".into()))?;
        self.set_finalizer(&handle, Release::call("free"))?;
        Ok(handle)
    }

    /// Scoped allocation of one `ty`, typed as a pointer to it.
    pub fn malloc_typed(&mut self, ty: &TypeRef) -> Result<Handle, CallError> {
        let ptr_ty = self.channel.registry().pointer_to(ty);
        let handle = self
            .call("malloc", &[Arg::from(ty.sizeof())])?
            .ok_or_else(|| CallError::VoidResult("malloc".into()))?;
        let handle = handle.cast(ptr_ty);
        self.set_finalizer(&handle, Release::call("free"))?;
        Ok(handle)
    }

    /// Reads `field` of the struct `ptr` points to.
    pub fn get_field(&mut self, ptr: &Handle, field: &str) -> Result<Handle, CallError> {
        let (slot, field_ty) = self.field_slot(ptr, field)?;
        let b = self.channel.resolver().builtins().clone();
        if field_ty.is_pointer() {
            let value = self.call_accessor("get", vec![slot.cast(b.void_ptr_ptr).into()])?;
            Ok(value.cast(field_ty))
        } else {
            let slot_ty = self.channel.registry().pointer_to(&field_ty);
            self.call_accessor("get", vec![slot.cast(slot_ty).into()])
        }
    }

    /// Writes `value` to `field` of the struct `ptr` points to.
    pub fn set_field(&mut self, ptr: &Handle, field: &str, value: impl Into<Arg>) -> Result<(), CallError> {
        let (slot, field_ty) = self.field_slot(ptr, field)?;
        let b = self.channel.resolver().builtins().clone();
        let value = value.into();
        if field_ty.is_pointer() {
            let value = match value {
                Arg::Handle(h) => Arg::Handle(h.cast(b.void_ptr.clone())),
                other => other,
            };
            self.call_accessor("set", vec![slot.cast(b.void_ptr_ptr).into(), value])?;
        } else {
            let slot_ty = self.channel.registry().pointer_to(&field_ty);
            self.call_accessor("set", vec![slot.cast(slot_ty).into(), value])?;
        }
        Ok(())
    }

    /// Enqueues `add(ptr, offset)` and returns the address handle with the field type.
    fn field_slot(&mut self, ptr: &Handle, field: &str) -> Result<(Handle, TypeRef), CallError> {
        let st = ptr
            .ty()
            .pointee()
            .and_then(|base| base.as_struct())
            .ok_or_else(|| CallError::NotAStructPointer(ptr.ty().to_string()))?;
        let field = st.field(field).ok_or_else(|| CallError::UnknownField {
            ty: ptr.ty().to_string(),
            field: field.into(),
        })?;
        let field_ty = field.ty.clone();
        let offset = field.offset;

        let slot = self
            .call("add", &[ptr.into(), Arg::from(offset)])?
            .ok_or_else(|| CallError::VoidResult("add".into()))?;
        Ok((slot, field_ty))
    }

    /// Calls the `get`/`set` overload keyed by the slot type, skipping
    /// ordinary resolution so that pointer leniency cannot pick a wider slot.
    fn call_accessor(&mut self, function: &str, args: Vec<Arg>) -> Result<Handle, CallError> {
        let registry = self.channel.registry().clone();
        let slot_ty = self.channel.resolver().infer(&args[0]);
        let sig = registry
            .function(function)
            .and_then(|set| set.by_first_param(&slot_ty))
            .ok_or_else(|| CallError::NoAccessor { function: function.into(), ty: slot_ty.to_string() })?;
        let result = self.call_signature(sig, &args)?;
        match result {
            Some(handle) => Ok(handle),
            // `set` returns void; hand back the slot so callers have something.
            None => match &args[0] {
                Arg::Handle(h) => Ok(h.clone()),
                Arg::Value(_) => Err(CallError::VoidResult(function.into())),
            },
        }
    }

    /// Runs the finalizers of `handles` (newest first), tells the peer to
    /// drop them, and unregisters their ids.
    ///
    /// Only handles owned by this context are released.
    pub fn release(&mut self, handles: &[Handle]) -> Result<(), FinalizerError> {
        let mut ids: Vec<HandleId> = Vec::with_capacity(handles.len());
        for handle in handles {
            if handle.context() != self.id {
                warn!(context = %self.id, handle = %handle, "not released: owned by {}", handle.context());
            } else if !ids.contains(&handle.id()) {
                ids.push(handle.id());
            }
        }
        self.release_ids(&ids)
    }

    fn release_ids(&mut self, ids: &[HandleId]) -> Result<(), FinalizerError> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut failures = Vec::new();
        loop {
            let finalizers = self.channel.handles().take_finalizers(ids);
            if finalizers.is_empty() {
                break;
            }
            for finalizer in finalizers {
                let id = finalizer.handle.id();
                if let Err(reason) = self.run_finalizer(finalizer) {
                    warn!(context = %self.id, handle = id, "finalizer failed: {}", reason);
                    failures.push((id, reason));
                }
            }
        }

        let released = self.forget(ids);
        debug!(context = %self.id, released, failed = failures.len(), "release");

        if failures.is_empty() {
            Ok(())
        } else {
            Err(FinalizerError { failures })
        }
    }

    /// Queues `*destroyHandles` for `ids` and drops them from the table.
    fn forget(&mut self, ids: &[HandleId]) -> usize {
        self.channel.push_command(batch::destroy_command(ids));
        let released = self.channel.handles().release(ids);
        self.owned.retain(|id| !ids.contains(id));
        released
    }

    fn run_finalizer(&mut self, finalizer: Finalizer) -> Result<(), String> {
        let Finalizer { handle, release } = finalizer;
        match release {
            Release::Call(function) => self
                .call(&function, &[Arg::Handle(handle)])
                .map(|_| ())
                .map_err(|e| e.to_string()),
            Release::Custom(f) => f(self, &handle),
        }
    }

    /// Releases every handle this context still owns. Handles created by
    /// finalizers during teardown are released too, for up to
    /// `TEARDOWN_PASSES` rounds; whatever is left after that is released
    /// without running its finalizers, and each skipped one is reported.
    pub fn destroy(mut self) -> Result<(), FinalizerError> {
        let mut failures = Vec::new();
        for _ in 0..TEARDOWN_PASSES {
            if self.owned.is_empty() {
                break;
            }
            let ids = self.owned.clone();
            if let Err(e) = self.release_ids(&ids) {
                failures.extend(e.failures);
            }
        }

        if !self.owned.is_empty() {
            let ids = self.owned.clone();
            warn!(context = %self.id, left = ids.len(), "teardown did not settle");
            let skipped = self.channel.handles().take_finalizers(&ids);
            for finalizer in skipped {
                failures.push((finalizer.handle.id(), "finalizer skipped: teardown did not settle".into()));
            }
            self.forget(&ids);
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(FinalizerError { failures })
        }
    }

    /// Commits the channel's batch. See `Channel::commit`.
    pub async fn commit(
        &self,
        outputs: &[Handle],
        callback: impl FnOnce(CommitResult) + Send + 'static,
    ) -> crate::channel::Result<u64> {
        self.channel.commit(outputs, callback).await
    }

    pub async fn commit_await(&self, outputs: &[Handle]) -> CommitResult {
        self.channel.commit_await(outputs).await
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if !self.owned.is_empty() {
            warn!(context = %self.id, live = self.owned.len(), "context dropped without destroy");
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("owned", &self.owned)
            .finish()
    }
}
