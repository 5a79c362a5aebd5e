//! Deterministic workload replay.
//!
//! [`run`] drives a fresh pool with a seeded, biased mix of allocate,
//! deallocate and reallocate calls over a fixed number of slots. Every block
//! is filled with a slot-specific byte pattern, and after each step the run
//! checks that
//! - returned pointers are aligned,
//! - no two live blocks overlap,
//! - patterns survive until the block is freed or resized,
//! - pooled blocks lie inside memory the arena acquired,
//! - live, free and unconsumed arena bytes never exceed `total_acquired`,
//! - `total_acquired` never decreases.
//!
//! After the drain every allocation must be matched by a deallocation.
//!
//! Exhaustion under a byte budget is expected and counted, not an error.

#![allow(unsafe_code)]

use std::collections::BTreeMap;
use std::ptr::NonNull;

use serde::Serialize;

use smallobj_core::pool::size_class::{self, ALIGN, MAX_BYTES};
use smallobj_core::{MeteredHeap, Pool, PoolConfig, PoolError, PoolLogRecord, PoolStats};

use crate::error::HarnessError;

/// Largest request the workload makes; above `MAX_BYTES` to exercise passthrough.
pub const MAX_REQUEST: usize = 512;

#[derive(Clone, Copy, Debug)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    /// A zero seed would stay zero forever; it is remapped.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed },
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    pub fn gen_range(&mut self, low: usize, high_inclusive: usize) -> usize {
        debug_assert!(low <= high_inclusive);
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

/// Parameters of one replay.
#[derive(Debug, Clone, Copy)]
pub struct WorkloadSpec {
    pub seed: u64,
    pub steps: usize,
    /// Concurrently tracked blocks.
    pub slots: usize,
    /// Byte budget for the system allocator (`None` = unlimited).
    pub budget: Option<usize>,
    pub config: PoolConfig,
}

impl Default for WorkloadSpec {
    fn default() -> Self {
        Self {
            seed: 0xDEAD_BEEF,
            steps: 10_000,
            slots: 64,
            budget: None,
            config: PoolConfig::default(),
        }
    }
}

/// Serializable copy of [`PoolStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSummary {
    pub allocations: u64,
    pub deallocations: u64,
    pub reallocations: u64,
    pub free_list_hits: u64,
    pub refills: u64,
    pub partial_refills: u64,
    pub arena_grows: u64,
    pub leftover_donations: u64,
    pub scavenges: u64,
    pub direct_fallbacks: u64,
    pub oversized_allocations: u64,
    pub out_of_memory: u64,
    pub size_mismatches: u64,
    pub rejected_frees: u64,
    pub rejected_reallocs: u64,
    pub pooled_live: usize,
}

impl From<PoolStats> for StatsSummary {
    fn from(s: PoolStats) -> Self {
        Self {
            allocations: s.allocations,
            deallocations: s.deallocations,
            reallocations: s.reallocations,
            free_list_hits: s.free_list_hits,
            refills: s.refills,
            partial_refills: s.partial_refills,
            arena_grows: s.arena_grows,
            leftover_donations: s.leftover_donations,
            scavenges: s.scavenges,
            direct_fallbacks: s.direct_fallbacks,
            oversized_allocations: s.oversized_allocations,
            out_of_memory: s.out_of_memory,
            size_mismatches: s.size_mismatches,
            rejected_frees: s.rejected_frees,
            rejected_reallocs: s.rejected_reallocs,
            pooled_live: s.pooled_live,
        }
    }
}

/// Outcome of a replay.
#[derive(Debug, Clone, Serialize)]
pub struct WorkloadReport {
    pub seed: u64,
    pub steps: usize,
    pub mode: &'static str,
    pub objects_per_refill: usize,
    pub budget: Option<usize>,
    /// Invariant checks performed (all passed, or the run would have failed).
    pub checks: u64,
    /// Requests refused with `OutOfMemory`.
    pub oom_events: u64,
    /// Sum of the sizes those refused requests asked for.
    pub refused_bytes: usize,
    pub peak_live_blocks: usize,
    pub peak_live_bytes: usize,
    pub total_acquired: usize,
    pub arena_remaining: usize,
    /// Bytes parked on free lists at the end of the run.
    pub free_bytes: usize,
    pub system_calls: u64,
    pub stats: StatsSummary,
}

#[derive(Debug, Clone, Copy)]
struct Block {
    ptr: NonNull<u8>,
    bytes: usize,
    fill: u8,
}

/// Live blocks keyed by address, each with the bytes it spans.
#[derive(Debug, Default)]
struct LiveRanges {
    spans: BTreeMap<usize, usize>,
    bytes: usize,
}

impl LiveRanges {
    fn insert(&mut self, addr: usize, span: usize) -> Result<(), String> {
        if let Some((&prev, &prev_span)) = self.spans.range(..=addr).next_back()
            && prev + prev_span > addr
        {
            return Err(format!(
                "block {addr:#x} overlaps live [{prev:#x}, +{prev_span})"
            ));
        }
        if let Some((&next, _)) = self.spans.range(addr..).next()
            && addr + span > next
        {
            return Err(format!(
                "block [{addr:#x}, +{span}) overlaps live {next:#x}"
            ));
        }
        self.spans.insert(addr, span);
        self.bytes += span;
        Ok(())
    }

    fn remove(&mut self, addr: usize) {
        if let Some(span) = self.spans.remove(&addr) {
            self.bytes -= span;
        }
    }

    fn len(&self) -> usize {
        self.spans.len()
    }
}

/// Bytes a block of `bytes` really occupies.
fn span_of(bytes: usize) -> usize {
    let bytes = size_class::normalize(bytes);
    if bytes <= MAX_BYTES {
        size_class::class_size(size_class::class_index(bytes))
    } else {
        bytes
    }
}

fn fill_for(slot: usize, step: usize) -> u8 {
    ((slot * 131) ^ (step * 7)) as u8 | 1
}

fn check_fill(block: &Block, len: usize, step: usize) -> Result<(), HarnessError> {
    // SAFETY: the block is live and at least `block.bytes >= len` long.
    let bytes = unsafe { std::slice::from_raw_parts(block.ptr.as_ptr(), len) };
    match bytes.iter().position(|&b| b != block.fill) {
        Some(off) => Err(HarnessError::violated(
            step,
            format!(
                "byte {off} of {:#x} is {:#04x}, expected {:#04x}",
                block.ptr.as_ptr() as usize,
                bytes[off],
                block.fill
            ),
        )),
        None => Ok(()),
    }
}

fn fill(ptr: NonNull<u8>, bytes: usize, value: u8) {
    // SAFETY: `ptr` was just returned for at least `bytes` bytes.
    unsafe { ptr.as_ptr().write_bytes(value, bytes) };
}

/// Replays `spec` against a fresh pool.
///
/// `sink` receives the pool's lifecycle records as they are produced.
pub fn run(
    spec: &WorkloadSpec,
    mut sink: impl FnMut(&PoolLogRecord),
) -> Result<WorkloadReport, HarnessError> {
    let system = MeteredHeap::new().budget(spec.budget);
    let mut pool = Pool::with_system(system, spec.config);
    let mut rng = XorShift64::new(spec.seed);
    let slots = spec.slots.max(1);
    let mut blocks: Vec<Option<Block>> = vec![None; slots];
    let mut live = LiveRanges::default();
    let mut checks = 0u64;
    let mut oom_events = 0u64;
    let mut refused_bytes = 0usize;
    let mut peak_live_blocks = 0;
    let mut peak_live_bytes = 0;
    let mut last_acquired = 0;

    for step in 0..spec.steps {
        let op = rng.gen_range(0, 99);
        let slot = rng.gen_range(0, slots - 1);
        let bytes = request_size(&mut rng);

        match (op, blocks[slot]) {
            (0..=54, None) => match pool.allocate(bytes) {
                Ok(ptr) => {
                    checks += admit(&mut live, ptr, bytes, step)?;
                    checks += check_owned(&pool, ptr, bytes, step)?;
                    let block = Block {
                        ptr,
                        bytes,
                        fill: fill_for(slot, step),
                    };
                    fill(ptr, bytes, block.fill);
                    blocks[slot] = Some(block);
                }
                Err(err @ PoolError::OutOfMemory { .. }) => {
                    oom_events += 1;
                    refused_bytes += err.bytes().unwrap_or(0);
                }
                Err(err) => return Err(err.into()),
            },
            (55..=79, Some(block)) => {
                check_fill(&block, block.bytes, step)?;
                checks += 1;
                live.remove(block.ptr.as_ptr() as usize);
                // SAFETY: the block is live and was obtained with `block.bytes`.
                unsafe { pool.deallocate(block.ptr.as_ptr(), block.bytes) };
                blocks[slot] = None;
            }
            (80..=99, Some(block)) => {
                check_fill(&block, block.bytes, step)?;
                checks += 1;
                // SAFETY: the block is live and was obtained with `block.bytes`.
                match unsafe { pool.reallocate(block.ptr.as_ptr(), block.bytes, bytes) } {
                    Ok(out) => {
                        live.remove(block.ptr.as_ptr() as usize);
                        checks += admit(&mut live, out, bytes, step)?;
                        checks += check_owned(&pool, out, bytes, step)?;
                        let kept = Block {
                            ptr: out,
                            bytes,
                            fill: block.fill,
                        };
                        check_fill(&kept, block.bytes.min(bytes), step)?;
                        checks += 1;
                        let refreshed = Block {
                            fill: fill_for(slot, step),
                            ..kept
                        };
                        fill(out, bytes, refreshed.fill);
                        blocks[slot] = Some(refreshed);
                    }
                    Err(err @ PoolError::OutOfMemory { .. }) => {
                        oom_events += 1;
                        refused_bytes += err.bytes().unwrap_or(0);
                        check_fill(&block, block.bytes, step)?;
                        checks += 1;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            _ => {}
        }

        let acquired = pool.total_acquired();
        if acquired < last_acquired {
            return Err(HarnessError::violated(
                step,
                format!("total_acquired fell from {last_acquired} to {acquired}"),
            ));
        }
        last_acquired = acquired;
        checks += 1;

        let pooled_live_bytes: usize = blocks
            .iter()
            .flatten()
            .filter(|b| size_class::is_pooled(b.bytes))
            .map(|b| span_of(b.bytes))
            .sum();
        let accounted =
            pooled_live_bytes + pool.free_lists().free_bytes() + pool.arena_remaining();
        if accounted > acquired {
            return Err(HarnessError::violated(
                step,
                format!("{accounted} bytes accounted for but only {acquired} acquired"),
            ));
        }
        checks += 1;

        peak_live_blocks = peak_live_blocks.max(live.len());
        peak_live_bytes = peak_live_bytes.max(live.bytes);
        for record in pool.drain_logs() {
            sink(&record);
        }
    }

    for block in blocks.iter().flatten() {
        check_fill(block, block.bytes, spec.steps)?;
        checks += 1;
        // SAFETY: every tracked block is live with its recorded size.
        unsafe { pool.deallocate(block.ptr.as_ptr(), block.bytes) };
    }
    for record in pool.drain_logs() {
        sink(&record);
    }

    let stats = pool.stats();
    if stats.pooled_live != 0 {
        return Err(HarnessError::violated(
            spec.steps,
            format!("{} pooled blocks still live after drain", stats.pooled_live),
        ));
    }
    if stats.allocations != stats.deallocations {
        return Err(HarnessError::violated(
            spec.steps,
            format!(
                "{} allocations but {} deallocations after drain",
                stats.allocations, stats.deallocations
            ),
        ));
    }

    Ok(WorkloadReport {
        seed: spec.seed,
        steps: spec.steps,
        mode: spec.config.mode.as_str(),
        objects_per_refill: pool.config().objects_per_refill,
        budget: spec.budget,
        checks,
        oom_events,
        refused_bytes,
        peak_live_blocks,
        peak_live_bytes,
        total_acquired: pool.total_acquired(),
        arena_remaining: pool.arena_remaining(),
        free_bytes: pool.free_lists().free_bytes(),
        system_calls: pool.system().calls(),
        stats: stats.into(),
    })
}

/// Mostly pooled sizes, one in eight oversized, occasionally zero.
fn request_size(rng: &mut XorShift64) -> usize {
    match rng.gen_range(0, 63) {
        0 => 0,
        1..=7 => rng.gen_range(MAX_BYTES + 1, MAX_REQUEST),
        _ => rng.gen_range(1, MAX_BYTES),
    }
}

/// Pooled blocks must come from a region the arena obtained.
fn check_owned(
    pool: &Pool<MeteredHeap>,
    ptr: NonNull<u8>,
    bytes: usize,
    step: usize,
) -> Result<u64, HarnessError> {
    if !size_class::is_pooled(bytes) {
        return Ok(0);
    }
    let addr = ptr.as_ptr() as usize;
    if !pool.arena().owns(addr) {
        return Err(HarnessError::violated(
            step,
            format!("pooled block {addr:#x} lies outside every acquired region"),
        ));
    }
    Ok(1)
}

/// Alignment and overlap checks for a freshly returned block.
fn admit(
    live: &mut LiveRanges,
    ptr: NonNull<u8>,
    bytes: usize,
    step: usize,
) -> Result<u64, HarnessError> {
    let addr = ptr.as_ptr() as usize;
    if addr % ALIGN != 0 {
        return Err(HarnessError::violated(
            step,
            format!("{addr:#x} is not {ALIGN}-byte aligned"),
        ));
    }
    live.insert(addr, span_of(bytes))
        .map_err(|detail| HarnessError::violated(step, detail))?;
    Ok(2)
}
