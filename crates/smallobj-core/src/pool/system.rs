//! System allocator seam.
//!
//! The pool asks a [`SystemAlloc`] backend for arena regions and forwards
//! oversized requests to it unchanged. [`SystemHeap`] is the process heap;
//! [`MeteredHeap`] wraps any backend with call counters and an optional byte
//! budget so memory pressure can be reproduced deterministically.

#![allow(unsafe_code)]

use std::ffi::c_void;
use std::ptr::NonNull;

use super::size_class::ALIGN;

/// Backend that supplies raw memory to the pool.
///
/// Every pointer handed out must be aligned to at least [`ALIGN`] bytes.
pub trait SystemAlloc {
    /// Allocates `bytes` bytes (`bytes > 0`). Returns `None` on exhaustion.
    fn allocate(&mut self, bytes: usize) -> Option<NonNull<u8>>;

    /// Releases a block.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from this backend's `allocate`/`reallocate` with
    /// exactly `bytes` bytes, and must not be used afterwards.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, bytes: usize);

    /// Resizes a block, preserving `min(old_bytes, new_bytes)` bytes.
    ///
    /// On failure returns `None` and the original block is left untouched.
    ///
    /// # Safety
    ///
    /// Same contract as [`SystemAlloc::deallocate`] for `ptr` and `old_bytes`.
    unsafe fn reallocate(
        &mut self,
        ptr: NonNull<u8>,
        old_bytes: usize,
        new_bytes: usize,
    ) -> Option<NonNull<u8>>;
}

impl<S: SystemAlloc + ?Sized> SystemAlloc for &mut S {
    fn allocate(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        (**self).allocate(bytes)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, bytes: usize) {
        // SAFETY: forwarded contract.
        unsafe { (**self).deallocate(ptr, bytes) }
    }

    unsafe fn reallocate(
        &mut self,
        ptr: NonNull<u8>,
        old_bytes: usize,
        new_bytes: usize,
    ) -> Option<NonNull<u8>> {
        // SAFETY: forwarded contract.
        unsafe { (**self).reallocate(ptr, old_bytes, new_bytes) }
    }
}

/// The process heap (`malloc`/`free`/`realloc`).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHeap;

impl SystemAlloc for SystemHeap {
    fn allocate(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        // SAFETY: malloc accepts any size; a null return is mapped to None.
        let ptr = unsafe { libc::malloc(bytes) }.cast::<u8>();
        debug_assert!(ptr.is_null() || (ptr as usize) % ALIGN == 0);
        NonNull::new(ptr)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, _bytes: usize) {
        // SAFETY: caller guarantees ptr came from malloc/realloc and is dead.
        unsafe { libc::free(ptr.as_ptr().cast::<c_void>()) }
    }

    unsafe fn reallocate(
        &mut self,
        ptr: NonNull<u8>,
        _old_bytes: usize,
        new_bytes: usize,
    ) -> Option<NonNull<u8>> {
        // SAFETY: caller guarantees ptr is live and owned by this heap. On
        // failure realloc leaves the original block intact.
        let out = unsafe { libc::realloc(ptr.as_ptr().cast::<c_void>(), new_bytes) };
        NonNull::new(out.cast::<u8>())
    }
}

/// Counters kept by [`MeteredHeap`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MeterSnapshot {
    pub allocate_calls: u64,
    pub deallocate_calls: u64,
    pub reallocate_calls: u64,
    pub failed_calls: u64,
    /// Bytes currently outstanding from the backend.
    pub live_bytes: usize,
    /// High-water mark of `live_bytes`.
    pub peak_bytes: usize,
}

/// Backend wrapper with call counters and an optional byte budget.
///
/// Once a request would push outstanding bytes past the budget it fails,
/// exactly as an exhausted system heap would.
#[derive(Debug, Default, Clone)]
pub struct MeteredHeap<S = SystemHeap> {
    inner: S,
    budget: Option<usize>,
    meter: MeterSnapshot,
}

impl MeteredHeap<SystemHeap> {
    /// Meter the process heap without a budget.
    #[must_use]
    pub fn new() -> Self {
        Self::wrap(SystemHeap)
    }

    /// Meter the process heap, failing beyond `budget` outstanding bytes.
    #[must_use]
    pub fn with_budget(budget: usize) -> Self {
        Self::wrap(SystemHeap).budget(Some(budget))
    }
}

impl<S: SystemAlloc> MeteredHeap<S> {
    #[must_use]
    pub fn wrap(inner: S) -> Self {
        Self {
            inner,
            budget: None,
            meter: MeterSnapshot::default(),
        }
    }

    /// Replace the byte budget (`None` = unlimited).
    #[must_use]
    pub fn budget(mut self, budget: Option<usize>) -> Self {
        self.budget = budget;
        self
    }

    /// Change the budget on a live meter.
    pub fn set_budget(&mut self, budget: Option<usize>) {
        self.budget = budget;
    }

    #[must_use]
    pub fn snapshot(&self) -> MeterSnapshot {
        self.meter
    }

    /// Total backend calls of any kind.
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.meter.allocate_calls + self.meter.deallocate_calls + self.meter.reallocate_calls
    }

    fn admits(&self, extra: usize) -> bool {
        match self.budget {
            Some(budget) => self
                .meter
                .live_bytes
                .checked_add(extra)
                .is_some_and(|total| total <= budget),
            None => true,
        }
    }

    fn note_live(&mut self) {
        self.meter.peak_bytes = self.meter.peak_bytes.max(self.meter.live_bytes);
    }
}

impl<S: SystemAlloc> SystemAlloc for MeteredHeap<S> {
    fn allocate(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        self.meter.allocate_calls += 1;
        if !self.admits(bytes) {
            self.meter.failed_calls += 1;
            return None;
        }
        let Some(ptr) = self.inner.allocate(bytes) else {
            self.meter.failed_calls += 1;
            return None;
        };
        self.meter.live_bytes += bytes;
        self.note_live();
        Some(ptr)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, bytes: usize) {
        self.meter.deallocate_calls += 1;
        self.meter.live_bytes = self.meter.live_bytes.saturating_sub(bytes);
        // SAFETY: forwarded contract.
        unsafe { self.inner.deallocate(ptr, bytes) }
    }

    unsafe fn reallocate(
        &mut self,
        ptr: NonNull<u8>,
        old_bytes: usize,
        new_bytes: usize,
    ) -> Option<NonNull<u8>> {
        self.meter.reallocate_calls += 1;
        if new_bytes > old_bytes && !self.admits(new_bytes - old_bytes) {
            self.meter.failed_calls += 1;
            return None;
        }
        // SAFETY: forwarded contract.
        let Some(out) = (unsafe { self.inner.reallocate(ptr, old_bytes, new_bytes) }) else {
            self.meter.failed_calls += 1;
            return None;
        };
        self.meter.live_bytes = self.meter.live_bytes.saturating_sub(old_bytes) + new_bytes;
        self.note_live();
        Some(out)
    }
}
