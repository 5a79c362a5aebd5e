//! Pool allocator state.
//!
//! Coordinates the free lists, the heap arena and the system allocator.
//! Requests up to `MAX_BYTES` are popped from the matching free list, which
//! is refilled in batches on a miss; larger requests go to the system
//! allocator untouched.
//!
//! A `Pool` is single-owner: every operation takes `&mut self`. Use
//! [`SharedPool`](crate::SharedPool) for cross-thread access.

#![allow(unsafe_code)]

use std::collections::HashMap;
use std::ptr::{self, NonNull};

use super::arena::HeapArena;
use super::free_list::FreeLists;
use super::log::{Fields, LifecycleLog, PoolLogLevel, PoolLogRecord};
use super::size_class::{self, MAX_BYTES, NUM_SIZE_CLASSES};
use super::system::{SystemAlloc, SystemHeap};
use crate::config::PoolConfig;
use crate::error::PoolError;

/// Counters describing what the pool has done so far.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Successful `allocate` calls (including those made by `reallocate`).
    pub allocations: u64,
    /// Blocks taken back (including those released by `reallocate`).
    pub deallocations: u64,
    /// Successful `reallocate` calls.
    pub reallocations: u64,
    /// Pooled allocations served straight from a non-empty free list.
    pub free_list_hits: u64,
    /// Free-list refills.
    pub refills: u64,
    /// Refills that obtained fewer objects than the configured batch.
    pub partial_refills: u64,
    /// New regions obtained from the system allocator.
    pub arena_grows: u64,
    /// Undersized arena tails pushed onto a free list.
    pub leftover_donations: u64,
    /// Larger free blocks repurposed as the arena region.
    pub scavenges: u64,
    /// Single objects requested directly after growth and scavenging failed.
    pub direct_fallbacks: u64,
    /// Requests above `MAX_BYTES` forwarded to the system allocator.
    pub oversized_allocations: u64,
    /// Exhaustion errors returned to callers.
    pub out_of_memory: u64,
    /// Hardened mode: deallocations whose size disagreed with the block's tag.
    pub size_mismatches: u64,
    /// Hardened mode: frees ignored because the pool did not own the pointer.
    pub rejected_frees: u64,
    /// Hardened mode: reallocations refused with `ForeignPointer`.
    pub rejected_reallocs: u64,
    /// Pooled blocks currently held by callers.
    pub pooled_live: usize,
}

/// Size recorded for a live block in hardened mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LiveTag {
    Class(usize),
    Oversized(usize),
}

impl LiveTag {
    fn for_bytes(bytes: usize) -> Self {
        if size_class::is_pooled(bytes) {
            Self::Class(size_class::class_index(bytes))
        } else {
            Self::Oversized(bytes)
        }
    }

    fn bytes(self) -> usize {
        match self {
            Self::Class(class) => size_class::class_size(class),
            Self::Oversized(bytes) => bytes,
        }
    }
}

/// Small-object pool.
///
/// Owns its arena regions; dropping the pool returns them to the system
/// allocator. Blocks still held by callers dangle after that.
pub struct Pool<S: SystemAlloc = SystemHeap> {
    pub(super) lists: FreeLists,
    pub(super) arena: HeapArena,
    pub(super) system: S,
    pub(super) stats: PoolStats,
    config: PoolConfig,
    log: LifecycleLog,
    /// Hardened mode only: live block address -> size tag.
    live: Option<HashMap<usize, LiveTag>>,
}

// SAFETY: the pool exclusively owns every region and free block it points
// into, so moving it to another thread moves that ownership too. It is not
// `Sync`: all mutation goes through `&mut self`.
unsafe impl<S: SystemAlloc + Send> Send for Pool<S> {}

impl Pool<SystemHeap> {
    /// Pool over the process heap with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    #[must_use]
    pub fn with_config(config: PoolConfig) -> Self {
        Self::with_system(SystemHeap, config)
    }
}

impl Default for Pool<SystemHeap> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: SystemAlloc> Pool<S> {
    /// Pool over an explicit backend.
    #[must_use]
    pub fn with_system(system: S, config: PoolConfig) -> Self {
        let config = config.with_objects_per_refill(config.objects_per_refill);
        Self {
            lists: FreeLists::new(),
            arena: HeapArena::new(),
            system,
            stats: PoolStats::default(),
            log: LifecycleLog::new(config.log_level, config.log_capacity),
            live: config.mode.tags_live_blocks().then(HashMap::new),
            config,
        }
    }

    /// Allocates a block of at least `bytes` bytes, aligned to `ALIGN`.
    ///
    /// A zero-byte request is served as a one-byte request.
    pub fn allocate(&mut self, bytes: usize) -> Result<NonNull<u8>, PoolError> {
        let bytes = size_class::normalize(bytes);

        if !size_class::is_pooled(bytes) {
            if bytes > isize::MAX as usize {
                self.record(
                    PoolLogLevel::Warn,
                    "allocate",
                    "oom",
                    "capacity_overflow",
                    Fields::bytes(bytes).class(NUM_SIZE_CLASSES),
                );
                return Err(PoolError::CapacityOverflow { bytes });
            }
            let Some(ptr) = self.system.allocate(bytes) else {
                self.stats.out_of_memory += 1;
                self.record(
                    PoolLogLevel::Warn,
                    "allocate",
                    "oom",
                    "passthrough_failed",
                    Fields::bytes(bytes).class(NUM_SIZE_CLASSES),
                );
                return Err(PoolError::OutOfMemory { bytes });
            };
            self.stats.allocations += 1;
            self.stats.oversized_allocations += 1;
            self.mark_live(ptr, LiveTag::Oversized(bytes));
            self.record(
                PoolLogLevel::Trace,
                "allocate",
                "alloc",
                "passthrough",
                Fields::bytes(bytes).class(NUM_SIZE_CLASSES).ptr(ptr.as_ptr() as usize),
            );
            return Ok(ptr);
        }

        let class = size_class::class_index(bytes);
        let ptr = match self.lists.pop(class) {
            Some(ptr) => {
                self.stats.free_list_hits += 1;
                self.record(
                    PoolLogLevel::Trace,
                    "allocate",
                    "alloc",
                    "free_list_hit",
                    Fields::bytes(bytes).class(class).ptr(ptr.as_ptr() as usize),
                );
                ptr
            }
            None => self.refill(class)?,
        };
        self.stats.allocations += 1;
        self.stats.pooled_live += 1;
        self.mark_live(ptr, LiveTag::Class(class));
        Ok(ptr)
    }

    /// Returns a block to the pool (or to the system allocator if oversized).
    ///
    /// A null `ptr` is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live block from this pool's `allocate`/
    /// `reallocate`, and `bytes` must round to the same size class as the
    /// size it was obtained with. In `Hardened` mode a wrong size or foreign
    /// pointer is detected instead of corrupting the lists.
    pub unsafe fn deallocate(&mut self, ptr: *mut u8, bytes: usize) {
        let Some(ptr) = NonNull::new(ptr) else {
            self.record(
                PoolLogLevel::Trace,
                "deallocate",
                "free_null",
                "noop",
                Fields::bytes(bytes),
            );
            return;
        };
        let Some(bytes) = self.resolve_size(ptr, bytes, "deallocate") else {
            return;
        };
        // SAFETY: forwarded caller contract, size checked above in hardened mode.
        unsafe { self.release(ptr, bytes) };
    }

    /// Resizes a block, preserving `min(old_bytes, new_bytes)` bytes.
    ///
    /// Same-class resizes return `ptr` unchanged; oversized-to-oversized
    /// resizes use the system allocator's resize. Otherwise a new block is
    /// allocated, filled, and the old one released. On error the old block
    /// is still live and unchanged. A null `ptr` behaves like `allocate`.
    ///
    /// # Safety
    ///
    /// Same contract as [`Pool::deallocate`] for `ptr` and `old_bytes`.
    pub unsafe fn reallocate(
        &mut self,
        ptr: *mut u8,
        old_bytes: usize,
        new_bytes: usize,
    ) -> Result<NonNull<u8>, PoolError> {
        let Some(old) = NonNull::new(ptr) else {
            return self.allocate(new_bytes);
        };
        let new_bytes = size_class::normalize(new_bytes);
        let Some(old_bytes) = self.resolve_size(old, old_bytes, "reallocate") else {
            return Err(PoolError::ForeignPointer {
                addr: old.as_ptr() as usize,
            });
        };

        if old_bytes > MAX_BYTES && new_bytes > MAX_BYTES {
            // SAFETY: `old` is a live oversized block of `old_bytes` from `system`.
            let Some(out) = (unsafe { self.system.reallocate(old, old_bytes, new_bytes) }) else {
                self.stats.out_of_memory += 1;
                self.record(
                    PoolLogLevel::Warn,
                    "reallocate",
                    "oom",
                    "passthrough_failed",
                    Fields::bytes(new_bytes)
                        .class(NUM_SIZE_CLASSES)
                        .ptr(old.as_ptr() as usize),
                );
                return Err(PoolError::OutOfMemory { bytes: new_bytes });
            };
            self.unmark_live(old);
            self.mark_live(out, LiveTag::Oversized(new_bytes));
            self.stats.reallocations += 1;
            self.record(
                PoolLogLevel::Trace,
                "reallocate",
                "realloc",
                "passthrough",
                Fields::bytes(new_bytes)
                    .class(NUM_SIZE_CLASSES)
                    .ptr(out.as_ptr() as usize),
            );
            return Ok(out);
        }

        let old_class = size_class::class_index(old_bytes);
        if old_class < NUM_SIZE_CLASSES && old_class == size_class::class_index(new_bytes) {
            self.stats.reallocations += 1;
            self.record(
                PoolLogLevel::Trace,
                "reallocate",
                "realloc",
                "same_class",
                Fields::bytes(new_bytes)
                    .class(old_class)
                    .ptr(old.as_ptr() as usize),
            );
            return Ok(old);
        }

        let out = self.allocate(new_bytes)?;
        // SAFETY: both blocks are live, distinct, and at least
        // `min(old_bytes, new_bytes)` bytes long.
        unsafe {
            ptr::copy_nonoverlapping(old.as_ptr(), out.as_ptr(), old_bytes.min(new_bytes));
            self.release(old, old_bytes);
        }
        self.stats.reallocations += 1;
        self.record(
            PoolLogLevel::Trace,
            "reallocate",
            "realloc",
            "moved",
            Fields::bytes(new_bytes)
                .class(size_class::class_index(new_bytes))
                .ptr(out.as_ptr() as usize),
        );
        Ok(out)
    }

    /// Obtains a batch for `class`, returning its first block and linking
    /// the rest onto the class's free list.
    fn refill(&mut self, class: usize) -> Result<NonNull<u8>, PoolError> {
        let size = size_class::class_size(class);
        let wanted = self.config.objects_per_refill;
        let mut objects = wanted;
        let chunk = self.chunk_alloc(size, &mut objects)?;

        self.stats.refills += 1;
        if objects < wanted {
            self.stats.partial_refills += 1;
        }
        if objects > 1 {
            // SAFETY: `chunk` spans `objects * size` bytes carved for this
            // refill alone; the first block goes to the caller.
            unsafe { self.lists.link_chunk(class, chunk.add(size), objects - 1) };
        }
        self.record(
            PoolLogLevel::Debug,
            "allocate",
            "refill",
            if objects < wanted { "partial" } else { "full" },
            Fields::bytes(size)
                .class(class)
                .objects(objects)
                .ptr(chunk.as_ptr() as usize),
        );
        Ok(chunk)
    }

    /// Routes a resolved block back to its free list or the system allocator.
    ///
    /// # Safety
    ///
    /// `ptr` is a live block of this pool whose canonical size is `bytes`.
    unsafe fn release(&mut self, ptr: NonNull<u8>, bytes: usize) {
        self.unmark_live(ptr);
        self.stats.deallocations += 1;

        if bytes > MAX_BYTES {
            // SAFETY: oversized blocks come straight from `system` with this size.
            unsafe { self.system.deallocate(ptr, bytes) };
            self.record(
                PoolLogLevel::Trace,
                "deallocate",
                "free",
                "passthrough",
                Fields::bytes(bytes)
                    .class(NUM_SIZE_CLASSES)
                    .ptr(ptr.as_ptr() as usize),
            );
            return;
        }

        let class = size_class::class_index(bytes);
        // SAFETY: the caller gives the block back; it spans `class_size(class)`.
        unsafe { self.lists.push(class, ptr) };
        self.stats.pooled_live = self.stats.pooled_live.saturating_sub(1);
        self.record(
            PoolLogLevel::Trace,
            "deallocate",
            "free",
            "free_list_push",
            Fields::bytes(bytes).class(class).ptr(ptr.as_ptr() as usize),
        );
    }

    /// Canonical size of a block being given back.
    ///
    /// Strict mode trusts the caller. Hardened mode consults the tag table:
    /// returns `None` for pointers the pool does not consider live and
    /// repairs mismatched sizes. A foreign free is ignored; a foreign
    /// reallocate is refused by the caller.
    fn resolve_size(&mut self, ptr: NonNull<u8>, bytes: usize, op: &'static str) -> Option<usize> {
        let bytes = size_class::normalize(bytes);
        let Some(live) = &self.live else {
            return Some(bytes);
        };
        let addr = ptr.as_ptr() as usize;
        let Some(&tag) = live.get(&addr) else {
            let event = if op == "reallocate" {
                self.stats.rejected_reallocs += 1;
                "foreign_pointer_rejected"
            } else {
                self.stats.rejected_frees += 1;
                "unknown_pointer_ignored"
            };
            self.record(
                PoolLogLevel::Warn,
                op,
                event,
                "rejected",
                Fields::bytes(bytes).ptr(addr),
            );
            return None;
        };
        if tag != LiveTag::for_bytes(bytes) {
            self.stats.size_mismatches += 1;
            self.record(
                PoolLogLevel::Warn,
                op,
                "size_mismatch_repaired",
                "repaired",
                Fields::bytes(bytes).ptr(addr).class(match tag {
                    LiveTag::Class(class) => class,
                    LiveTag::Oversized(_) => NUM_SIZE_CLASSES,
                }),
            );
        }
        Some(tag.bytes())
    }

    fn mark_live(&mut self, ptr: NonNull<u8>, tag: LiveTag) {
        if let Some(live) = &mut self.live {
            let previous = live.insert(ptr.as_ptr() as usize, tag);
            debug_assert!(previous.is_none(), "block handed out twice");
        }
    }

    fn unmark_live(&mut self, ptr: NonNull<u8>) {
        if let Some(live) = &mut self.live {
            live.remove(&(ptr.as_ptr() as usize));
        }
    }

    pub(super) fn record(
        &mut self,
        level: PoolLogLevel,
        op: &'static str,
        event: &'static str,
        outcome: &'static str,
        fields: Fields,
    ) {
        if !self.log.enabled(level) {
            return;
        }
        self.log.push(PoolLogRecord {
            seq: 0,
            level,
            op,
            event,
            outcome,
            ptr: fields.ptr,
            bytes: fields.bytes,
            class: fields.class,
            objects: fields.objects,
            total_acquired: self.arena.total_acquired(),
            arena_remaining: self.arena.remaining(),
        });
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Bytes ever obtained from the system allocator for the arena.
    #[must_use]
    pub fn total_acquired(&self) -> usize {
        self.arena.total_acquired()
    }

    /// Bytes left in the current arena region.
    #[must_use]
    pub fn arena_remaining(&self) -> usize {
        self.arena.remaining()
    }

    #[must_use]
    pub fn arena(&self) -> &HeapArena {
        &self.arena
    }

    #[must_use]
    pub fn free_lists(&self) -> &FreeLists {
        &self.lists
    }

    /// Blocks waiting on the free list of `class`.
    #[must_use]
    pub fn free_count(&self, class: usize) -> usize {
        self.lists.len(class)
    }

    /// Lifecycle records currently retained, oldest first.
    pub fn logs(&self) -> impl ExactSizeIterator<Item = &PoolLogRecord> + '_ {
        self.log.records()
    }

    /// Removes and returns the retained lifecycle records.
    pub fn drain_logs(&mut self) -> Vec<PoolLogRecord> {
        self.log.drain()
    }

    #[must_use]
    pub fn system(&self) -> &S {
        &self.system
    }

    /// Mutable access to the backend, e.g. to adjust a [`MeteredHeap`](super::system::MeteredHeap) budget.
    pub fn system_mut(&mut self) -> &mut S {
        &mut self.system
    }
}

impl<S: SystemAlloc> Drop for Pool<S> {
    fn drop(&mut self) {
        // SAFETY: the pool is going away; every region came from `self.system`.
        unsafe { self.arena.release_all(&mut self.system) };
    }
}

impl<S: SystemAlloc> std::fmt::Debug for Pool<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.config)
            .field("arena", &self.arena)
            .field("lists", &self.lists)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolMode;
    use crate::pool::size_class::ALIGN;
    use crate::pool::system::MeteredHeap;

    fn metered() -> Pool<MeteredHeap> {
        Pool::with_system(MeteredHeap::new(), PoolConfig::default())
    }

    fn hardened() -> Pool<MeteredHeap> {
        Pool::with_system(
            MeteredHeap::new(),
            PoolConfig::default().with_mode(PoolMode::Hardened),
        )
    }

    #[test]
    fn test_new_pool() {
        let pool = Pool::new();
        assert_eq!(pool.total_acquired(), 0);
        assert_eq!(pool.arena_remaining(), 0);
        assert_eq!(pool.stats(), PoolStats::default());
    }

    #[test]
    fn test_allocate_alignment() {
        let mut pool = metered();
        for bytes in 1..=MAX_BYTES {
            let ptr = pool.allocate(bytes).unwrap();
            assert_eq!(ptr.as_ptr() as usize % ALIGN, 0, "bytes={bytes}");
        }
    }

    #[test]
    fn test_first_allocation_refills() {
        let mut pool = metered();
        let ptr = pool.allocate(16).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.refills, 1);
        assert_eq!(stats.arena_grows, 1);
        assert_eq!(pool.free_count(1), 19);
        // 2 * 20 * 16 requested, half carved.
        assert_eq!(pool.total_acquired(), 640);
        assert_eq!(pool.arena_remaining(), 320);
        unsafe { pool.deallocate(ptr.as_ptr(), 16) };
        assert_eq!(pool.free_count(1), 20);
    }

    #[test]
    fn test_hit_after_free() {
        let mut pool = metered();
        let a = pool.allocate(24).unwrap();
        unsafe { pool.deallocate(a.as_ptr(), 24) };
        let b = pool.allocate(20).unwrap();
        assert_eq!(a, b);
        assert_eq!(pool.stats().free_list_hits, 1);
    }

    #[test]
    fn test_zero_bytes_uses_smallest_class() {
        let mut pool = metered();
        let ptr = pool.allocate(0).unwrap();
        assert_eq!(pool.free_count(0), 19);
        unsafe { pool.deallocate(ptr.as_ptr(), 0) };
        assert_eq!(pool.free_count(0), 20);
    }

    #[test]
    fn test_deallocate_null_is_noop() {
        let mut pool = metered();
        unsafe { pool.deallocate(ptr::null_mut(), 16) };
        assert_eq!(pool.stats().deallocations, 0);
    }

    #[test]
    fn test_oversized_passthrough() {
        let mut pool = metered();
        let ptr = pool.allocate(MAX_BYTES + 1).unwrap();
        assert_eq!(pool.total_acquired(), 0);
        assert_eq!(pool.system().snapshot().live_bytes, MAX_BYTES + 1);
        unsafe { pool.deallocate(ptr.as_ptr(), MAX_BYTES + 1) };
        assert_eq!(pool.system().snapshot().live_bytes, 0);
        assert_eq!(pool.stats().oversized_allocations, 1);
    }

    #[test]
    fn test_oversized_failure_is_reported() {
        let mut pool = Pool::with_system(MeteredHeap::with_budget(64), PoolConfig::default());
        let err = pool.allocate(4096).unwrap_err();
        assert_eq!(err, PoolError::OutOfMemory { bytes: 4096 });
        assert_eq!(pool.stats().out_of_memory, 1);
    }

    #[test]
    fn test_oversized_beyond_isize_is_capacity_overflow() {
        let mut pool = metered();
        let err = pool.allocate(usize::MAX).unwrap_err();
        assert_eq!(err, PoolError::CapacityOverflow { bytes: usize::MAX });
        assert_eq!(pool.system().snapshot().allocate_calls, 0);
    }

    #[test]
    fn test_reallocate_same_class_returns_same_pointer() {
        let mut pool = metered();
        let ptr = pool.allocate(10).unwrap();
        let out = unsafe { pool.reallocate(ptr.as_ptr(), 10, 10) }.unwrap();
        assert_eq!(out, ptr);
        let out = unsafe { pool.reallocate(ptr.as_ptr(), 10, 16) }.unwrap();
        assert_eq!(out, ptr);
    }

    #[test]
    fn test_reallocate_grow_preserves_bytes() {
        let mut pool = metered();
        let ptr = pool.allocate(8).unwrap();
        unsafe { ptr.as_ptr().copy_from_nonoverlapping(b"abcdefgh".as_ptr(), 8) };
        let out = unsafe { pool.reallocate(ptr.as_ptr(), 8, 64) }.unwrap();
        assert_ne!(out, ptr);
        let bytes = unsafe { std::slice::from_raw_parts(out.as_ptr(), 8) };
        assert_eq!(bytes, b"abcdefgh");
        // Old block went back to its list.
        assert_eq!(pool.free_count(0), 20);
    }

    #[test]
    fn test_reallocate_oversized_to_pooled() {
        let mut pool = metered();
        let big = pool.allocate(200).unwrap();
        unsafe { big.as_ptr().write_bytes(0x5A, 200) };
        let small = unsafe { pool.reallocate(big.as_ptr(), 200, 10) }.unwrap();
        assert_ne!(small, big);
        let bytes = unsafe { std::slice::from_raw_parts(small.as_ptr(), 10) };
        assert!(bytes.iter().all(|&b| b == 0x5A));
        let snap = pool.system().snapshot();
        assert_eq!(snap.deallocate_calls, 1);
        assert_eq!(snap.live_bytes, pool.total_acquired());
    }

    #[test]
    fn test_reallocate_oversized_uses_system_resize() {
        let mut pool = metered();
        let big = pool.allocate(256).unwrap();
        let out = unsafe { pool.reallocate(big.as_ptr(), 256, 4096) }.unwrap();
        assert_eq!(pool.system().snapshot().reallocate_calls, 1);
        unsafe { pool.deallocate(out.as_ptr(), 4096) };
        assert_eq!(pool.system().snapshot().live_bytes, 0);
    }

    #[test]
    fn test_oversized_resize_cycle_balances_counts() {
        for mut pool in [metered(), hardened()] {
            let big = pool.allocate(200).unwrap();
            let out = unsafe { pool.reallocate(big.as_ptr(), 200, 4096) }.unwrap();
            unsafe { pool.deallocate(out.as_ptr(), 4096) };
            let stats = pool.stats();
            assert_eq!(stats.allocations, 1);
            assert_eq!(stats.deallocations, 1);
            assert_eq!(stats.reallocations, 1);
            assert_eq!(pool.system().snapshot().live_bytes, 0);
        }
    }

    #[test]
    fn test_moving_reallocate_balances_counts() {
        let mut pool = metered();
        let p = pool.allocate(16).unwrap();
        let q = unsafe { pool.reallocate(p.as_ptr(), 16, 96) }.unwrap();
        let r = unsafe { pool.reallocate(q.as_ptr(), 96, 300) }.unwrap();
        unsafe { pool.deallocate(r.as_ptr(), 300) };
        let stats = pool.stats();
        assert_eq!(stats.allocations, 3);
        assert_eq!(stats.deallocations, 3);
        assert_eq!(stats.pooled_live, 0);
    }

    #[test]
    fn test_reallocate_null_allocates() {
        let mut pool = metered();
        let out = unsafe { pool.reallocate(ptr::null_mut(), 0, 32) }.unwrap();
        assert_eq!(pool.stats().allocations, 1);
        unsafe { pool.deallocate(out.as_ptr(), 32) };
    }

    #[test]
    fn test_reallocate_failure_keeps_old_block() {
        let mut pool = Pool::with_system(MeteredHeap::new(), PoolConfig::default());
        let small = pool.allocate(8).unwrap();
        unsafe { small.as_ptr().write(7) };
        pool.system_mut().set_budget(Some(0));
        let err = unsafe { pool.reallocate(small.as_ptr(), 8, 1024) }.unwrap_err();
        assert_eq!(err, PoolError::OutOfMemory { bytes: 1024 });
        assert_eq!(unsafe { small.as_ptr().read() }, 7);
        assert_eq!(pool.stats().pooled_live, 1);
    }

    #[test]
    fn test_drop_releases_regions() {
        let mut heap_view = MeteredHeap::new();
        {
            let mut pool = Pool::with_system(&mut heap_view, PoolConfig::default());
            for _ in 0..50 {
                pool.allocate(48).unwrap();
            }
            assert!(pool.system().snapshot().live_bytes > 0);
        }
        assert_eq!(heap_view.snapshot().live_bytes, 0);
    }

    #[test]
    fn test_hardened_repairs_size_mismatch() {
        let mut pool = hardened();
        let ptr = pool.allocate(8).unwrap();
        unsafe { pool.deallocate(ptr.as_ptr(), 64) };
        let stats = pool.stats();
        assert_eq!(stats.size_mismatches, 1);
        // Went back to the 8-byte class, not the 64-byte one.
        assert_eq!(pool.free_count(0), 20);
        assert_eq!(pool.free_count(7), 0);
        assert!(
            pool.logs()
                .any(|r| r.event == "size_mismatch_repaired" && r.level == PoolLogLevel::Warn)
        );
    }

    #[test]
    fn test_hardened_ignores_double_free() {
        let mut pool = hardened();
        let ptr = pool.allocate(32).unwrap();
        unsafe {
            pool.deallocate(ptr.as_ptr(), 32);
            pool.deallocate(ptr.as_ptr(), 32);
        }
        assert_eq!(pool.stats().rejected_frees, 1);
        assert_eq!(pool.free_count(3), 20);
    }

    #[test]
    fn test_hardened_reallocate_foreign_pointer() {
        let mut pool = hardened();
        let mut local = [0u64; 2];
        let err = unsafe { pool.reallocate(local.as_mut_ptr().cast(), 16, 32) }.unwrap_err();
        assert!(matches!(err, PoolError::ForeignPointer { .. }));
        let stats = pool.stats();
        assert_eq!(stats.rejected_reallocs, 1);
        assert_eq!(stats.rejected_frees, 0);
        let events: Vec<_> = pool.logs().map(|r| r.event).collect();
        assert_eq!(events, vec!["foreign_pointer_rejected"]);
    }

    #[test]
    fn test_trace_level_records_hits() {
        let mut pool = Pool::with_system(
            MeteredHeap::new(),
            PoolConfig::default().with_log_level(PoolLogLevel::Trace),
        );
        let a = pool.allocate(16).unwrap();
        unsafe { pool.deallocate(a.as_ptr(), 16) };
        pool.allocate(16).unwrap();
        let events: Vec<_> = pool.logs().map(|r| (r.event, r.outcome)).collect();
        assert!(events.contains(&("refill", "full")));
        assert!(events.contains(&("free", "free_list_push")));
        assert!(events.contains(&("alloc", "free_list_hit")));
        assert_eq!(pool.drain_logs().len(), events.len());
        assert_eq!(pool.logs().len(), 0);
    }
}
