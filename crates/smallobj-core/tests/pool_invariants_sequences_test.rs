//! Seeded allocate/free/reallocate sequences checked against the pool invariants.

#![allow(unsafe_code)]

use smallobj_core::pool::size_class::{self, ALIGN, MAX_BYTES};
use smallobj_core::{MeteredHeap, Pool, PoolConfig, PoolMode};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range(&mut self, low: usize, high_inclusive: usize) -> usize {
        assert!(low <= high_inclusive);
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

/// Bytes a block really spans: its class size, or the request when oversized.
fn span(bytes: usize) -> usize {
    let bytes = size_class::normalize(bytes);
    size_class::round_up(bytes)
        .filter(|_| bytes <= MAX_BYTES)
        .unwrap_or(bytes)
}

fn fill_byte(slot: usize, generation: usize) -> u8 {
    (slot.wrapping_mul(31) ^ generation) as u8
}

/// Live blocks keyed by address, each with its span.
#[derive(Default)]
struct LiveSet {
    blocks: BTreeMap<usize, usize>,
}

impl LiveSet {
    fn insert(&mut self, addr: usize, span: usize, ctx: &str) {
        if let Some((&prev, &prev_span)) = self.blocks.range(..=addr).next_back() {
            assert!(
                prev + prev_span <= addr,
                "{ctx}: block {addr:#x} overlaps [{prev:#x}, +{prev_span})"
            );
        }
        if let Some((&next, _)) = self.blocks.range(addr..).next() {
            assert!(
                addr + span <= next,
                "{ctx}: block [{addr:#x}, +{span}) overlaps {next:#x}"
            );
        }
        self.blocks.insert(addr, span);
    }

    fn remove(&mut self, addr: usize) {
        assert!(self.blocks.remove(&addr).is_some(), "unknown block {addr:#x}");
    }
}

#[derive(Clone, Copy)]
struct Slot {
    ptr: *mut u8,
    bytes: usize,
    fill: u8,
}

fn check_fill(slot: &Slot, ctx: &str) {
    for off in 0..slot.bytes {
        let got = unsafe { *slot.ptr.add(off) };
        assert_eq!(got, slot.fill, "{ctx}: byte {off} of {:p} clobbered", slot.ptr);
    }
}

fn run_sequence(seed: u64, mode: PoolMode) {
    const STEPS: usize = 3_000;
    const SLOTS: usize = 48;

    let config = PoolConfig::default().with_mode(mode);
    let mut pool = Pool::with_system(MeteredHeap::new(), config);
    let mut rng = XorShift64::new(seed);
    let mut slots: Vec<Option<Slot>> = vec![None; SLOTS];
    let mut live = LiveSet::default();
    let mut last_acquired = 0;

    for step in 0..STEPS {
        let ctx = format!("seed={seed} mode={} step={step}", mode.as_str());
        let op = rng.gen_range(0, 99);
        let idx = rng.gen_range(0, SLOTS - 1);

        match (op, slots[idx]) {
            (0..=54, None) => {
                // Mostly pooled sizes, some passthrough.
                let bytes = if rng.gen_range(0, 9) == 0 {
                    rng.gen_range(MAX_BYTES + 1, 1024)
                } else {
                    rng.gen_range(0, MAX_BYTES)
                };
                let ptr = pool.allocate(bytes).expect("unbounded heap");
                let addr = ptr.as_ptr() as usize;
                assert_eq!(addr % ALIGN, 0, "{ctx}: misaligned {addr:#x}");
                live.insert(addr, span(bytes), &ctx);
                let fill = fill_byte(idx, step);
                unsafe { ptr.as_ptr().write_bytes(fill, bytes) };
                slots[idx] = Some(Slot {
                    ptr: ptr.as_ptr(),
                    bytes,
                    fill,
                });
            }
            (55..=79, Some(slot)) => {
                check_fill(&slot, &ctx);
                live.remove(slot.ptr as usize);
                unsafe { pool.deallocate(slot.ptr, slot.bytes) };
                slots[idx] = None;
            }
            (80..=99, Some(slot)) => {
                check_fill(&slot, &ctx);
                let new_bytes = rng.gen_range(0, 300);
                live.remove(slot.ptr as usize);
                let out = unsafe { pool.reallocate(slot.ptr, slot.bytes, new_bytes) }
                    .expect("unbounded heap");
                let addr = out.as_ptr() as usize;
                assert_eq!(addr % ALIGN, 0, "{ctx}: misaligned realloc {addr:#x}");
                live.insert(addr, span(new_bytes), &ctx);
                let kept = slot.bytes.min(new_bytes);
                for off in 0..kept {
                    assert_eq!(
                        unsafe { *out.as_ptr().add(off) },
                        slot.fill,
                        "{ctx}: realloc lost byte {off}"
                    );
                }
                let fill = fill_byte(idx, step);
                unsafe { out.as_ptr().write_bytes(fill, new_bytes) };
                slots[idx] = Some(Slot {
                    ptr: out.as_ptr(),
                    bytes: new_bytes,
                    fill,
                });
            }
            _ => {}
        }

        let acquired = pool.total_acquired();
        assert!(acquired >= last_acquired, "{ctx}: total_acquired shrank");
        last_acquired = acquired;
    }

    for (idx, slot) in slots.iter().enumerate() {
        if let Some(slot) = slot {
            check_fill(slot, &format!("seed={seed} drain slot={idx}"));
            unsafe { pool.deallocate(slot.ptr, slot.bytes) };
        }
    }
    let stats = pool.stats();
    assert_eq!(stats.pooled_live, 0, "seed={seed}: pooled blocks leaked");
    assert_eq!(stats.size_mismatches, 0);
    assert_eq!(stats.rejected_frees, 0);
    assert_eq!(stats.out_of_memory, 0);
}

#[test]
fn deterministic_sequences_hold_pool_invariants_strict() {
    for seed in [1, 2, 3, 4, 0x5EED] {
        run_sequence(seed, PoolMode::Strict);
    }
}

#[test]
fn deterministic_sequences_hold_pool_invariants_hardened() {
    for seed in [7, 11, 13] {
        run_sequence(seed, PoolMode::Hardened);
    }
}

#[test]
fn freed_blocks_are_reused_without_system_calls() {
    let mut rng = XorShift64::new(42);
    let mut pool = Pool::with_system(MeteredHeap::new(), PoolConfig::default());

    for class in 0..size_class::NUM_SIZE_CLASSES {
        let size = size_class::class_size(class);
        let count = rng.gen_range(1, 60);
        let mut freed: Vec<usize> = (0..count)
            .map(|_| pool.allocate(size).unwrap().as_ptr() as usize)
            .collect();
        for &addr in &freed {
            unsafe { pool.deallocate(addr as *mut u8, size) };
        }

        let calls = pool.system().calls();
        let acquired = pool.total_acquired();
        let mut again: Vec<usize> = (0..count)
            .map(|_| pool.allocate(size).unwrap().as_ptr() as usize)
            .collect();
        assert_eq!(pool.system().calls(), calls, "class={class}: system touched");
        assert_eq!(pool.total_acquired(), acquired);

        freed.sort_unstable();
        again.sort_unstable();
        assert_eq!(freed, again, "class={class}: reuse multiset differs");
        for &addr in &again {
            unsafe { pool.deallocate(addr as *mut u8, size) };
        }
    }
}

#[test]
fn interleaved_classes_never_overlap() {
    let mut pool = Pool::new();
    let mut live = LiveSet::default();
    let mut held = Vec::new();
    for round in 0..40 {
        for bytes in (1..=MAX_BYTES).step_by(7) {
            let ptr = pool.allocate(bytes).unwrap();
            let addr = ptr.as_ptr() as usize;
            live.insert(addr, span(bytes), &format!("round={round} bytes={bytes}"));
            held.push((addr, bytes));
        }
        // Free every third block to mix reuse with fresh carving.
        let mut kept = Vec::new();
        for (i, (addr, bytes)) in held.drain(..).enumerate() {
            if i % 3 == 0 {
                live.remove(addr);
                unsafe { pool.deallocate(addr as *mut u8, bytes) };
            } else {
                kept.push((addr, bytes));
            }
        }
        held = kept;
    }
    for (addr, bytes) in held {
        unsafe { pool.deallocate(addr as *mut u8, bytes) };
    }
}
