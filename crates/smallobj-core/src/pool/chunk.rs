//! Chunk acquisition for free-list refills.
//!
//! A refill asks for `objects` blocks of one size. The fallback chain runs
//! strictly in order, each step at most once per call:
//!
//! 1. carve the whole batch, or as many whole objects as fit, from the arena;
//! 2. push the arena's undersized tail onto its matching free list, then ask
//!    the system allocator for a region of `2 * batch + total_acquired / 16`;
//! 3. if that fails, install a block from a larger class's free list as the
//!    region;
//! 4. if nothing larger is free, request a single object directly;
//! 5. otherwise report exhaustion.

#![allow(unsafe_code)]

use std::ptr::NonNull;

use super::allocator::Pool;
use super::log::{Fields, PoolLogLevel};
use super::size_class::{self, ALIGN, MAX_BYTES, NUM_SIZE_CLASSES};
use super::system::SystemAlloc;
use crate::error::PoolError;

impl<S: SystemAlloc> Pool<S> {
    /// Obtains a contiguous chunk of `*objects` blocks of `size` bytes.
    ///
    /// On return `*objects` holds the number of blocks actually served
    /// (at least one).
    pub(super) fn chunk_alloc(
        &mut self,
        size: usize,
        objects: &mut usize,
    ) -> Result<NonNull<u8>, PoolError> {
        debug_assert!(size > 0 && size <= MAX_BYTES && size % ALIGN == 0);
        debug_assert!(*objects > 0);

        if let Some(chunk) = self.carve_objects(size, objects) {
            return Ok(chunk);
        }

        self.donate_leftover();

        let chunk_bytes = size * *objects;
        let request = self.arena.grow_request(chunk_bytes);
        let grown = match request {
            Some(bytes) => self.arena.acquire(&mut self.system, bytes),
            None => false,
        };
        if grown {
            self.stats.arena_grows += 1;
            self.record(
                PoolLogLevel::Info,
                "allocate",
                "arena_grow",
                "success",
                Fields::bytes(request.unwrap_or(0))
                    .class(size_class::class_index(size))
                    .objects(*objects),
            );
        } else {
            self.record(
                PoolLogLevel::Warn,
                "allocate",
                "arena_grow_failed",
                "fallback",
                Fields::bytes(request.unwrap_or(usize::MAX))
                    .class(size_class::class_index(size)),
            );
            if !self.scavenge(size) {
                return self.direct_fallback(size, objects);
            }
        }

        // The region now holds at least one object.
        self.carve_objects(size, objects)
            .ok_or(PoolError::OutOfMemory { bytes: size })
    }

    /// Steps 1 and 2 of the chain: serve from the current region if it holds
    /// at least one object. Leaves any sub-object tail in place.
    fn carve_objects(&mut self, size: usize, objects: &mut usize) -> Option<NonNull<u8>> {
        let remaining = self.arena.remaining();
        let wanted = size * *objects;

        if remaining >= wanted {
            let chunk = self.arena.carve(wanted)?;
            self.record(
                PoolLogLevel::Trace,
                "allocate",
                "chunk_carve",
                "full",
                Fields::bytes(wanted)
                    .class(size_class::class_index(size))
                    .objects(*objects)
                    .ptr(chunk.as_ptr() as usize),
            );
            return Some(chunk);
        }

        if remaining >= size {
            let fit = remaining / size;
            let chunk = self.arena.carve(size * fit)?;
            *objects = fit;
            self.record(
                PoolLogLevel::Debug,
                "allocate",
                "chunk_partial",
                "partial",
                Fields::bytes(size * fit)
                    .class(size_class::class_index(size))
                    .objects(fit)
                    .ptr(chunk.as_ptr() as usize),
            );
            return Some(chunk);
        }

        None
    }

    /// Pushes the arena's undersized tail onto the free list of its exact size.
    fn donate_leftover(&mut self) {
        let Some((block, bytes)) = self.arena.take_leftover() else {
            return;
        };
        // Regions and scavenged blocks are multiples of ALIGN, and the tail
        // is smaller than the object that did not fit.
        debug_assert!(bytes % ALIGN == 0 && bytes <= MAX_BYTES);
        let class = size_class::class_index(bytes);
        if class >= NUM_SIZE_CLASSES {
            return;
        }
        // SAFETY: the tail was unconsumed arena memory owned by the pool and
        // spans exactly `class_size(class)` bytes.
        unsafe { self.lists.push(class, block) };
        self.stats.leftover_donations += 1;
        self.record(
            PoolLogLevel::Debug,
            "allocate",
            "leftover_donated",
            "success",
            Fields::bytes(bytes).class(class).ptr(block.as_ptr() as usize),
        );
    }

    /// Installs a free block of a strictly larger class as the arena region.
    fn scavenge(&mut self, size: usize) -> bool {
        let first = size_class::class_index(size) + 1;
        for class in first..NUM_SIZE_CLASSES {
            let Some(block) = self.lists.pop(class) else {
                continue;
            };
            // SAFETY: the block just left its free list, so the pool owns it
            // exclusively; it lies inside a tracked region and the arena was
            // emptied by `donate_leftover`.
            unsafe { self.arena.install(block, size_class::class_size(class)) };
            self.stats.scavenges += 1;
            self.record(
                PoolLogLevel::Info,
                "allocate",
                "scavenge",
                "success",
                Fields::bytes(size_class::class_size(class))
                    .class(class)
                    .ptr(block.as_ptr() as usize),
            );
            return true;
        }
        false
    }

    /// Last resort: one object straight from the system allocator.
    fn direct_fallback(
        &mut self,
        size: usize,
        objects: &mut usize,
    ) -> Result<NonNull<u8>, PoolError> {
        let class = size_class::class_index(size);
        match self.arena.acquire_direct(&mut self.system, size) {
            Some(block) => {
                *objects = 1;
                self.stats.direct_fallbacks += 1;
                self.record(
                    PoolLogLevel::Warn,
                    "allocate",
                    "direct_fallback",
                    "success",
                    Fields::bytes(size)
                        .class(class)
                        .objects(1)
                        .ptr(block.as_ptr() as usize),
                );
                Ok(block)
            }
            None => {
                self.stats.out_of_memory += 1;
                self.record(
                    PoolLogLevel::Error,
                    "allocate",
                    "oom",
                    "exhausted",
                    Fields::bytes(size).class(class),
                );
                Err(PoolError::OutOfMemory { bytes: size })
            }
        }
    }
}
