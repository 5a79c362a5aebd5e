//! Thread-safe pool wrapper.
//!
//! A [`Pool`] takes `&mut self` everywhere. `SharedPool` serializes access
//! behind a `parking_lot::Mutex` so one pool can serve many threads.

#![allow(unsafe_code)]

use std::ptr::NonNull;
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::pool::system::{SystemAlloc, SystemHeap};
use crate::pool::{Pool, PoolStats};

/// A [`Pool`] behind a mutex.
pub struct SharedPool<S: SystemAlloc = SystemHeap> {
    inner: Mutex<Pool<S>>,
}

impl<S: SystemAlloc> SharedPool<S> {
    #[must_use]
    pub fn new(pool: Pool<S>) -> Self {
        Self {
            inner: Mutex::new(pool),
        }
    }

    /// See [`Pool::allocate`].
    pub fn allocate(&self, bytes: usize) -> Result<NonNull<u8>, PoolError> {
        self.inner.lock().allocate(bytes)
    }

    /// See [`Pool::deallocate`].
    ///
    /// # Safety
    ///
    /// Same contract as [`Pool::deallocate`].
    pub unsafe fn deallocate(&self, ptr: *mut u8, bytes: usize) {
        // SAFETY: forwarded caller contract.
        unsafe { self.inner.lock().deallocate(ptr, bytes) }
    }

    /// See [`Pool::reallocate`].
    ///
    /// # Safety
    ///
    /// Same contract as [`Pool::reallocate`].
    pub unsafe fn reallocate(
        &self,
        ptr: *mut u8,
        old_bytes: usize,
        new_bytes: usize,
    ) -> Result<NonNull<u8>, PoolError> {
        // SAFETY: forwarded caller contract.
        unsafe { self.inner.lock().reallocate(ptr, old_bytes, new_bytes) }
    }

    /// Runs `f` with the pool locked.
    pub fn with<R>(&self, f: impl FnOnce(&mut Pool<S>) -> R) -> R {
        f(&mut self.inner.lock())
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.inner.lock().stats()
    }

    pub fn into_inner(self) -> Pool<S> {
        self.inner.into_inner()
    }
}

impl Default for SharedPool<SystemHeap> {
    fn default() -> Self {
        Self::new(Pool::new())
    }
}

impl<S: SystemAlloc> std::fmt::Debug for SharedPool<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedPool").finish_non_exhaustive()
    }
}

/// Process-wide pool over the system heap, configured from the environment
/// on first use (`SMALLOBJ_MODE`, `SMALLOBJ_REFILL_BATCH`, `SMALLOBJ_LOG_LEVEL`).
///
/// Its regions live until process exit.
pub fn global() -> &'static SharedPool<SystemHeap> {
    static POOL: OnceLock<SharedPool<SystemHeap>> = OnceLock::new();
    POOL.get_or_init(|| SharedPool::new(Pool::with_config(PoolConfig::from_env())))
}
