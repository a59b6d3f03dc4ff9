// src/handle.rs - Reference-counted native handles with dependent lifetimes
use std::ffi::c_void;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{NativeError, Result};
use crate::native::RawFreeFn;

// High bit: release requested. Low bits: live references (owner + dependants + guards).
const CLOSED: usize = 1 << (usize::BITS - 1);
const COUNT_MASK: usize = !CLOSED;

/// Lifecycle of a [`ResourceHandle`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Constructing,
    Live,
    Released,
}

/// Owns one native pointer, optionally depending on a parent handle.
///
/// The native object is freed when the owner has called [`ResourceHandle::release`] (or
/// dropped the last `Arc`) *and* no dependant or guard still references it. A dependant
/// holds one reference on its parent from construction until its own native object is
/// freed, so a parent is never freed under a live child.
#[derive(Debug)]
pub struct ResourceHandle {
    kind: &'static str,
    ptr: AtomicPtr<c_void>,
    state: AtomicUsize,
    deleter: RawFreeFn,
    parent: Option<Arc<ResourceHandle>>,
}

impl ResourceHandle {
    /// Adopt a native object with no parent.
    ///
    /// # Safety
    /// `ptr` must be a live object that `deleter` frees, and nothing else may free it.
    pub unsafe fn new_root(
        ptr: NonNull<c_void>,
        deleter: RawFreeFn,
        kind: &'static str,
    ) -> Arc<Self> {
        let handle = Self::constructing(ptr, deleter, kind, None);
        handle.state.store(1, Ordering::Release);
        log::debug!("Created {} handle {:p}", kind, ptr);
        Arc::new(handle)
    }

    /// Adopt a native object that must not outlive `parent`.
    ///
    /// The parent's count is raised before the handle goes live. If the parent has already
    /// been released this fails with [`NativeError::InvalidHandleUse`], the parent is left
    /// untouched, and `ptr` stays owned by the caller.
    ///
    /// # Safety
    /// Same contract as [`ResourceHandle::new_root`].
    pub unsafe fn new_dependent(
        ptr: NonNull<c_void>,
        deleter: RawFreeFn,
        parent: &Arc<ResourceHandle>,
        kind: &'static str,
    ) -> Result<Arc<Self>> {
        let mut handle = Self::constructing(ptr, deleter, kind, None);
        if let Err(err) = parent.add_ref() {
            log::warn!(
                "Refusing to create {} handle: parent {} already released",
                kind,
                parent.kind
            );
            return Err(err);
        }
        handle.parent = Some(Arc::clone(parent));
        handle.state.store(1, Ordering::Release);
        log::debug!("Created {} handle {:p} on {}", kind, ptr, parent.kind);
        Ok(Arc::new(handle))
    }

    fn constructing(
        ptr: NonNull<c_void>,
        deleter: RawFreeFn,
        kind: &'static str,
        parent: Option<Arc<ResourceHandle>>,
    ) -> Self {
        Self {
            kind,
            ptr: AtomicPtr::new(ptr.as_ptr()),
            state: AtomicUsize::new(0),
            deleter,
            parent,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn state(&self) -> HandleState {
        let word = self.state.load(Ordering::Acquire);
        if word & CLOSED != 0 {
            HandleState::Released
        } else if word & COUNT_MASK == 0 {
            HandleState::Constructing
        } else {
            HandleState::Live
        }
    }

    /// Live references: the owner's, one per dependant, one per active guard
    pub fn ref_count(&self) -> usize {
        self.state.load(Ordering::Acquire) & COUNT_MASK
    }

    /// Whether the native object has been freed
    pub fn is_freed(&self) -> bool {
        self.ptr.load(Ordering::Acquire).is_null()
    }

    pub fn parent(&self) -> Option<&Arc<ResourceHandle>> {
        self.parent.as_ref()
    }

    /// Raw pointer for immediate use. Prefer [`ResourceHandle::enter`] when another thread
    /// might release the handle concurrently.
    pub fn ptr(&self) -> Result<NonNull<c_void>> {
        if self.state() != HandleState::Live {
            return Err(NativeError::InvalidHandleUse(self.kind));
        }
        NonNull::new(self.ptr.load(Ordering::Acquire))
            .ok_or(NativeError::InvalidHandleUse(self.kind))
    }

    /// Take a reference that keeps the native object alive. Fails once released.
    /// Every success must be matched by one [`ResourceHandle::release_ref`].
    pub(crate) fn add_ref(&self) -> Result<()> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current & CLOSED != 0 || current & COUNT_MASK == 0 {
                return Err(NativeError::InvalidHandleUse(self.kind));
            }
            match self.state.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop a reference taken with [`ResourceHandle::add_ref`]; frees the native object if it
    /// was the last one.
    pub(crate) fn release_ref(&self) {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let count = current & COUNT_MASK;
            if count == 0 {
                log::error!("{} handle reference count underflow", self.kind);
                return;
            }
            match self.state.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if count == 1 {
                        self.free_native();
                    }
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Give up the owner's reference. Idempotent; later calls are no-ops.
    pub fn release(&self) {
        let previous = self.state.fetch_or(CLOSED, Ordering::AcqRel);
        if previous & CLOSED != 0 || previous & COUNT_MASK == 0 {
            return;
        }
        log::debug!(
            "Releasing {} handle ({} other references)",
            self.kind,
            (previous & COUNT_MASK) - 1
        );
        self.release_ref();
    }

    /// Reference-holding guard over the native pointer
    pub fn enter(&self) -> Result<HandleGuard<'_>> {
        self.add_ref()?;
        match NonNull::new(self.ptr.load(Ordering::Acquire)) {
            Some(ptr) => Ok(HandleGuard { handle: self, ptr }),
            None => {
                self.release_ref();
                Err(NativeError::InvalidHandleUse(self.kind))
            }
        }
    }

    fn free_native(&self) {
        let ptr = self.ptr.swap(ptr::null_mut(), Ordering::AcqRel);
        if !ptr.is_null() {
            unsafe { (self.deleter)(ptr) };
            log::debug!("Freed {} {:p}", self.kind, ptr);
        }
        // Only after our own object is gone may the parent go
        if let Some(parent) = &self.parent {
            parent.release_ref();
        }
    }
}

impl Drop for ResourceHandle {
    fn drop(&mut self) {
        // Last-resort path when the owner never called release()
        if self.state() == HandleState::Live {
            log::debug!("{} handle dropped without explicit release", self.kind);
        }
        self.release();
    }
}

/// Holds one reference on a handle for as long as the pointer is in use
#[derive(Debug)]
pub struct HandleGuard<'a> {
    handle: &'a ResourceHandle,
    ptr: NonNull<c_void>,
}

impl HandleGuard<'_> {
    pub fn ptr(&self) -> NonNull<c_void> {
        self.ptr
    }
}

impl Drop for HandleGuard<'_> {
    fn drop(&mut self) {
        self.handle.release_ref();
    }
}

/// A loaded model. Clones share one native model.
#[derive(Debug, Clone)]
pub struct ModelHandle {
    inner: Arc<ResourceHandle>,
}

impl ModelHandle {
    /// # Safety
    /// `ptr` must be a live model that `deleter` frees.
    pub unsafe fn from_raw(ptr: NonNull<c_void>, deleter: RawFreeFn) -> Self {
        Self {
            inner: ResourceHandle::new_root(ptr, deleter, "model"),
        }
    }

    pub fn handle(&self) -> &Arc<ResourceHandle> {
        &self.inner
    }

    /// Release the model. Its native memory stays until every context built on it is gone.
    pub fn release(&self) {
        self.inner.release();
    }
}

/// An inference context. Keeps its model alive until the context itself is freed.
#[derive(Debug)]
pub struct ContextHandle {
    inner: Arc<ResourceHandle>,
    model: ModelHandle,
}

impl ContextHandle {
    /// # Safety
    /// `ptr` must be a live context created from `model` that `deleter` frees.
    pub unsafe fn from_raw(
        ptr: NonNull<c_void>,
        deleter: RawFreeFn,
        model: &ModelHandle,
    ) -> Result<Self> {
        let inner = ResourceHandle::new_dependent(ptr, deleter, model.handle(), "context")?;
        Ok(Self {
            inner,
            model: model.clone(),
        })
    }

    pub fn model(&self) -> &ModelHandle {
        &self.model
    }

    pub fn handle(&self) -> &Arc<ResourceHandle> {
        &self.inner
    }

    pub fn enter(&self) -> Result<HandleGuard<'_>> {
        self.inner.enter()
    }

    pub fn release(&self) {
        self.inner.release();
    }
}
