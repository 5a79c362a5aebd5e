//! Heap arena.
//!
//! A contiguous, not-yet-carved byte range `[start, end)` that the pool
//! consumes front to back when refilling free lists. The arena grows by
//! asking the system allocator for a fresh region; it never shrinks, and the
//! regions are only handed back when the owning pool is dropped.

#![allow(unsafe_code)]

use std::ptr::{self, NonNull};

use super::size_class::round_up;
use super::system::SystemAlloc;

/// A block obtained from the system allocator on the arena's behalf.
#[derive(Debug, Clone, Copy)]
struct Region {
    base: NonNull<u8>,
    bytes: usize,
}

/// Unconsumed region plus growth bookkeeping.
pub struct HeapArena {
    start: *mut u8,
    end: *mut u8,
    /// Bytes ever obtained from the system allocator. Never decreases.
    total_acquired: usize,
    regions: Vec<Region>,
}

impl HeapArena {
    /// An arena with no region; the first refill acquires one.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            start: ptr::null_mut(),
            end: ptr::null_mut(),
            total_acquired: 0,
            regions: Vec::new(),
        }
    }

    /// Bytes left in the current region.
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.end as usize - self.start as usize
    }

    #[inline]
    #[must_use]
    pub fn total_acquired(&self) -> usize {
        self.total_acquired
    }

    /// Number of blocks obtained from the system allocator.
    #[must_use]
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Returns true if `addr` lies inside memory this arena obtained.
    #[must_use]
    pub fn owns(&self, addr: usize) -> bool {
        self.regions
            .iter()
            .any(|r| addr >= r.base.as_ptr() as usize && addr < r.base.as_ptr() as usize + r.bytes)
    }

    /// Size of the next region for a chunk of `chunk_bytes`:
    /// twice the chunk plus a sixteenth of everything acquired so far,
    /// rounded to the alignment. `None` on overflow.
    #[must_use]
    pub fn grow_request(&self, chunk_bytes: usize) -> Option<usize> {
        let history = round_up(self.total_acquired >> 4)?;
        chunk_bytes.checked_mul(2)?.checked_add(history)
    }

    /// Takes `bytes` from the front of the region.
    pub(crate) fn carve(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        if bytes == 0 || self.remaining() < bytes {
            return None;
        }
        let out = NonNull::new(self.start)?;
        // SAFETY: `bytes <= remaining`, so the result stays within `[start, end]`.
        self.start = unsafe { self.start.add(bytes) };
        Some(out)
    }

    /// Empties the region, returning whatever was left of it.
    pub(crate) fn take_leftover(&mut self) -> Option<(NonNull<u8>, usize)> {
        let bytes = self.remaining();
        let base = NonNull::new(self.start)?;
        if bytes == 0 {
            return None;
        }
        self.start = self.end;
        Some((base, bytes))
    }

    /// Makes `[block, block + bytes)` the current region.
    ///
    /// # Safety
    ///
    /// The block must be exclusively owned by the pool, come from memory the
    /// arena already tracks, and the current region must be empty.
    pub(crate) unsafe fn install(&mut self, block: NonNull<u8>, bytes: usize) {
        debug_assert_eq!(self.remaining(), 0, "installing over a live region leaks it");
        self.start = block.as_ptr();
        // SAFETY: caller guarantees the block spans `bytes` bytes.
        self.end = unsafe { self.start.add(bytes) };
    }

    /// Requests a new region of `bytes` and installs it.
    ///
    /// Returns false (arena untouched) if the system allocator fails.
    pub(crate) fn acquire(&mut self, system: &mut impl SystemAlloc, bytes: usize) -> bool {
        let Some(block) = self.acquire_direct(system, bytes) else {
            return false;
        };
        // SAFETY: the block was just obtained and recorded.
        unsafe { self.install(block, bytes) };
        true
    }

    /// Requests a block of `bytes` that bypasses the region.
    ///
    /// The block is recorded so it is released with the arena.
    pub(crate) fn acquire_direct(
        &mut self,
        system: &mut impl SystemAlloc,
        bytes: usize,
    ) -> Option<NonNull<u8>> {
        let total_acquired = self.total_acquired.checked_add(bytes)?;
        self.regions.try_reserve(1).ok()?;
        let base = system.allocate(bytes)?;
        self.regions.push(Region { base, bytes });
        self.total_acquired = total_acquired;
        Some(base)
    }

    /// Returns every recorded region to `system` and resets the arena.
    /// `total_acquired` is kept.
    ///
    /// # Safety
    ///
    /// No block carved from the arena may be used afterwards, and `system`
    /// must be the backend the regions came from.
    pub(crate) unsafe fn release_all(&mut self, system: &mut impl SystemAlloc) {
        for region in self.regions.drain(..) {
            // SAFETY: each region came from `system.allocate(region.bytes)`.
            unsafe { system.deallocate(region.base, region.bytes) };
        }
        self.start = ptr::null_mut();
        self.end = ptr::null_mut();
    }
}

impl Default for HeapArena {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HeapArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapArena")
            .field("remaining", &self.remaining())
            .field("total_acquired", &self.total_acquired)
            .field("regions", &self.regions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::system::MeteredHeap;

    #[test]
    fn test_new_arena_empty() {
        let arena = HeapArena::new();
        assert_eq!(arena.remaining(), 0);
        assert_eq!(arena.total_acquired(), 0);
        assert_eq!(arena.region_count(), 0);
    }

    #[test]
    fn test_carve_empty_returns_none() {
        let mut arena = HeapArena::new();
        assert!(arena.carve(8).is_none());
        assert!(arena.take_leftover().is_none());
    }

    #[test]
    fn test_acquire_and_carve() {
        let mut heap = MeteredHeap::new();
        let mut arena = HeapArena::new();
        assert!(arena.acquire(&mut heap, 640));
        assert_eq!(arena.remaining(), 640);
        assert_eq!(arena.total_acquired(), 640);

        let a = arena.carve(320).unwrap();
        let b = arena.carve(320).unwrap();
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 320);
        assert!(arena.carve(8).is_none());
        assert!(arena.owns(a.as_ptr() as usize + 639));
        assert!(!arena.owns(a.as_ptr() as usize + 640));

        unsafe { arena.release_all(&mut heap) };
        assert_eq!(heap.snapshot().live_bytes, 0);
        assert_eq!(arena.total_acquired(), 640);
    }

    #[test]
    fn test_take_leftover() {
        let mut heap = MeteredHeap::new();
        let mut arena = HeapArena::new();
        assert!(arena.acquire(&mut heap, 100));
        let first = arena.carve(96).unwrap();
        let (tail, bytes) = arena.take_leftover().unwrap();
        assert_eq!(bytes, 4);
        assert_eq!(tail.as_ptr() as usize, first.as_ptr() as usize + 96);
        assert_eq!(arena.remaining(), 0);
        assert!(arena.take_leftover().is_none());
        unsafe { arena.release_all(&mut heap) };
    }

    #[test]
    fn test_grow_request_policy() {
        let mut heap = MeteredHeap::new();
        let mut arena = HeapArena::new();
        assert_eq!(arena.grow_request(320), Some(640));
        assert!(arena.acquire(&mut heap, 1320));
        // 1320 >> 4 = 82, rounded up to 88.
        assert_eq!(arena.grow_request(320), Some(728));
        assert_eq!(arena.grow_request(usize::MAX), None);
        unsafe { arena.release_all(&mut heap) };
    }

    #[test]
    fn test_acquire_failure_leaves_arena_untouched() {
        let mut heap = MeteredHeap::with_budget(64);
        let mut arena = HeapArena::new();
        assert!(!arena.acquire(&mut heap, 128));
        assert_eq!(arena.remaining(), 0);
        assert_eq!(arena.total_acquired(), 0);
        assert_eq!(arena.region_count(), 0);
    }

    #[test]
    fn test_acquire_direct_is_tracked_but_not_installed() {
        let mut heap = MeteredHeap::new();
        let mut arena = HeapArena::new();
        let block = arena.acquire_direct(&mut heap, 24).unwrap();
        assert_eq!(arena.remaining(), 0);
        assert_eq!(arena.total_acquired(), 24);
        assert!(arena.owns(block.as_ptr() as usize));
        unsafe { arena.release_all(&mut heap) };
        assert_eq!(heap.snapshot().live_bytes, 0);
    }
}
