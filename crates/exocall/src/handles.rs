//! # Handles
//!
//! A handle is a local reference to a value that lives in the peer. The id is
//! the only thing that crosses the wire; the type travels with the handle on
//! this side so calls can be type-checked before they are batched.
//!
//! ## Invariants
//! - Ids come from a monotonic counter and are never reused while live.
//! - `cast` never allocates: the new handle shares the id of its origin.
//! - A root id has at most one finalizer.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use neotype::TypeRef;

use crate::context::Context;

pub type HandleId = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    UnknownHandle(HandleId),
    FinalizerAlreadySet(HandleId),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownHandle(id) => write!(f, "handle {} is not live", id),
            Self::FinalizerAlreadySet(id) => write!(f, "handle {} already has a finalizer", id),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug)]
pub struct Handle {
    id: HandleId,
    ty: TypeRef,
    context: ContextId,
    cloned_from: Option<Arc<Handle>>,
}

impl Handle {
    pub(crate) fn new(id: HandleId, ty: TypeRef, context: ContextId) -> Self {
        Self { id, ty, context, cloned_from: None }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn ty(&self) -> &TypeRef {
        &self.ty
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn cloned_from(&self) -> Option<&Handle> {
        self.cloned_from.as_deref()
    }

    /// The handle this one was ultimately cast from.
    pub fn root(&self) -> &Handle {
        let mut current = self;
        while let Some(origin) = current.cloned_from() {
            current = origin;
        }
        current
    }

    pub fn is_root(&self) -> bool {
        self.cloned_from.is_none()
    }

    /// Reinterprets the same remote value as `ty`.
    pub fn cast(&self, ty: TypeRef) -> Handle {
        Handle {
            id: self.id,
            ty,
            context: self.context,
            cloned_from: Some(Arc::new(self.clone())),
        }
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.ty == other.ty
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Handle {} {}]", self.id, self.ty)
    }
}

/// What happens to a handle's remote value when the handle is released.
pub enum Release {
    /// Enqueue a call to the named function with the handle as its only argument.
    Call(String),
    /// Run arbitrary cleanup. The error string ends up in `FinalizerError`.
    Custom(Box<dyn FnOnce(&mut Context, &Handle) -> std::result::Result<(), String> + Send>),
}

impl Release {
    pub fn call(function: impl Into<String>) -> Self {
        Self::Call(function.into())
    }

    pub fn custom(
        f: impl FnOnce(&mut Context, &Handle) -> std::result::Result<(), String> + Send + 'static,
    ) -> Self {
        Self::Custom(Box::new(f))
    }
}

impl fmt::Debug for Release {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Call(name) => f.debug_tuple("Call").field(name).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[derive(Debug)]
pub struct Finalizer {
    pub handle: Handle,
    pub release: Release,
}

/// Channel-wide table of live handles, shared by all contexts.
#[derive(Debug)]
pub struct HandleTable {
    next_id: HandleId,
    live: BTreeMap<HandleId, Handle>,
    finalizers: HashMap<HandleId, Finalizer>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            live: BTreeMap::new(),
            finalizers: HashMap::new(),
        }
    }

    pub fn allocate(&mut self, context: ContextId, ty: TypeRef) -> Handle {
        let id = self.next_id;
        self.next_id += 1;
        let handle = Handle::new(id, ty, context);
        self.live.insert(id, handle.clone());
        handle
    }

    /// The root handle registered under `id`.
    pub fn lookup(&self, id: HandleId) -> Option<&Handle> {
        self.live.get(&id)
    }

    pub fn is_live(&self, id: HandleId) -> bool {
        self.live.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Casts a live handle. Fails if the id has been released.
    pub fn cast(&self, handle: &Handle, ty: TypeRef) -> Result<Handle> {
        if !self.is_live(handle.id) {
            return Err(Error::UnknownHandle(handle.id));
        }
        Ok(handle.cast(ty))
    }

    /// Attaches a finalizer to the root of `handle`.
    pub fn set_finalizer(&mut self, handle: &Handle, release: Release) -> Result<()> {
        let id = handle.id;
        if !self.is_live(id) {
            return Err(Error::UnknownHandle(id));
        }
        if self.finalizers.contains_key(&id) {
            return Err(Error::FinalizerAlreadySet(id));
        }
        self.finalizers.insert(id, Finalizer { handle: handle.root().clone(), release });
        Ok(())
    }

    pub fn has_finalizer(&self, id: HandleId) -> bool {
        self.finalizers.contains_key(&id)
    }

    /// Removes the finalizers attached to `ids`, newest handle first.
    pub fn take_finalizers(&mut self, ids: &[HandleId]) -> Vec<Finalizer> {
        let mut ids = ids.to_vec();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        ids.dedup();
        ids.iter().filter_map(|id| self.finalizers.remove(id)).collect()
    }

    /// Unregisters `ids`. Returns how many were live.
    ///
    /// Finalizers must have been taken first; any left behind are dropped.
    pub fn release(&mut self, ids: &[HandleId]) -> usize {
        let mut released = 0;
        for id in ids {
            if self.finalizers.remove(id).is_some() {
                tracing::warn!(handle = id, "finalizer dropped without running");
            }
            if self.live.remove(id).is_some() {
                released += 1;
            }
        }
        released
    }
}
