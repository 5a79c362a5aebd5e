//! Fixed pool scenarios.
//!
//! Each scenario builds a fresh metered pool, performs a short scripted
//! sequence and records named checks. A failed check does not abort the
//! scenario; the report carries every result.

#![allow(unsafe_code)]

use std::collections::BTreeSet;

use serde::Serialize;

use smallobj_core::config::DEFAULT_OBJECTS_PER_REFILL;
use smallobj_core::pool::size_class::{self, NUM_SIZE_CLASSES};
use smallobj_core::{MeteredHeap, Pool, PoolConfig, PoolError};

use crate::error::HarnessError;
use crate::workload::StatsSummary;

/// Budget used by the pressure scenario when none is given.
pub const DEFAULT_PRESSURE_BUDGET: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scenario {
    /// 100 sequential 16-byte allocations from an empty arena.
    Burst,
    /// Free-then-reallocate returns the same addresses without system calls.
    Reuse,
    /// Same-class and oversized-to-pooled reallocation.
    Realloc,
    /// Exhaustion under a byte budget, then recovery.
    Pressure,
}

impl Scenario {
    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "burst" => Some(Self::Burst),
            "reuse" => Some(Self::Reuse),
            "realloc" | "reallocate" => Some(Self::Realloc),
            "pressure" | "oom" => Some(Self::Pressure),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Burst => "burst",
            Self::Reuse => "reuse",
            Self::Realloc => "realloc",
            Self::Pressure => "pressure",
        }
    }

    #[must_use]
    pub const fn all() -> [Self; 4] {
        [Self::Burst, Self::Reuse, Self::Realloc, Self::Pressure]
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioCheck {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario: Scenario,
    pub mode: &'static str,
    pub passed: bool,
    pub checks: Vec<ScenarioCheck>,
    pub total_acquired: usize,
    pub stats: StatsSummary,
}

#[derive(Default)]
struct Checks(Vec<ScenarioCheck>);

impl Checks {
    fn check(&mut self, name: &'static str, passed: bool, detail: impl Into<String>) {
        self.0.push(ScenarioCheck {
            name,
            passed,
            detail: detail.into(),
        });
    }
}

/// Runs `scenario` on a fresh pool configured by `config`.
///
/// `budget` only applies to [`Scenario::Pressure`].
pub fn run_scenario(
    scenario: Scenario,
    config: PoolConfig,
    budget: Option<usize>,
) -> Result<ScenarioReport, HarnessError> {
    let mut checks = Checks::default();
    let pool = match scenario {
        Scenario::Burst => burst(config, &mut checks)?,
        Scenario::Reuse => reuse(config, &mut checks)?,
        Scenario::Realloc => realloc(config, &mut checks)?,
        Scenario::Pressure => pressure(
            config,
            budget.unwrap_or(DEFAULT_PRESSURE_BUDGET),
            &mut checks,
        )?,
    };
    Ok(ScenarioReport {
        scenario,
        mode: config.mode.as_str(),
        passed: checks.0.iter().all(|c| c.passed),
        checks: checks.0,
        total_acquired: pool.total_acquired(),
        stats: pool.stats().into(),
    })
}

fn metered(config: PoolConfig) -> Pool<MeteredHeap> {
    Pool::with_system(MeteredHeap::new(), config)
}

fn burst(config: PoolConfig, checks: &mut Checks) -> Result<Pool<MeteredHeap>, HarnessError> {
    // The expected refill count is defined for the default batch.
    let mut pool = metered(config.with_objects_per_refill(DEFAULT_OBJECTS_PER_REFILL));
    let mut addrs = BTreeSet::new();
    for _ in 0..100 {
        addrs.insert(pool.allocate(16)?.as_ptr() as usize);
    }
    checks.check(
        "distinct",
        addrs.len() == 100,
        format!("{} distinct pointers", addrs.len()),
    );

    let sorted: Vec<usize> = addrs.iter().copied().collect();
    let overlaps = sorted.windows(2).filter(|w| w[0] + 16 > w[1]).count();
    checks.check(
        "non_overlapping",
        overlaps == 0,
        format!("{overlaps} overlapping neighbours"),
    );

    let stats = pool.stats();
    let full = stats.refills - stats.partial_refills;
    checks.check(
        "full_batches",
        full == 100 / DEFAULT_OBJECTS_PER_REFILL as u64,
        format!(
            "{full} full refills, {} partial (arena tails)",
            stats.partial_refills
        ),
    );
    checks.check(
        "aligned",
        sorted.iter().all(|a| a % size_class::ALIGN == 0),
        "all pointers 8-byte aligned",
    );

    for addr in sorted {
        // SAFETY: each address is a live 16-byte block from this pool.
        unsafe { pool.deallocate(addr as *mut u8, 16) };
    }
    Ok(pool)
}

fn reuse(config: PoolConfig, checks: &mut Checks) -> Result<Pool<MeteredHeap>, HarnessError> {
    let mut pool = metered(config);
    let count = config.objects_per_refill * 2 + 3;
    for class in 0..NUM_SIZE_CLASSES {
        let size = size_class::class_size(class);
        let mut first = Vec::with_capacity(count);
        for _ in 0..count {
            first.push(pool.allocate(size)?.as_ptr() as usize);
        }
        for &addr in &first {
            // SAFETY: live blocks of `size` from this pool.
            unsafe { pool.deallocate(addr as *mut u8, size) };
        }

        let calls = pool.system().calls();
        let mut second = Vec::with_capacity(count);
        for _ in 0..count {
            second.push(pool.allocate(size)?.as_ptr() as usize);
        }
        let quiet = pool.system().calls() == calls;

        first.sort_unstable();
        second.sort_unstable();
        checks.check(
            "same_addresses",
            first == second,
            format!("class {class} ({size} bytes), {count} blocks"),
        );
        checks.check(
            "no_system_calls",
            quiet,
            format!("class {class}: {} backend calls", pool.system().calls() - calls),
        );

        for &addr in &second {
            // SAFETY: live blocks of `size` from this pool.
            unsafe { pool.deallocate(addr as *mut u8, size) };
        }
    }
    Ok(pool)
}

fn realloc(config: PoolConfig, checks: &mut Checks) -> Result<Pool<MeteredHeap>, HarnessError> {
    let mut pool = metered(config);

    let ptr = pool.allocate(10)?;
    // SAFETY: `ptr` is live with 10 bytes.
    let same = unsafe { pool.reallocate(ptr.as_ptr(), 10, 10) }?;
    checks.check(
        "same_class_identity",
        same == ptr,
        format!("{:#x} -> {:#x}", ptr.as_ptr() as usize, same.as_ptr() as usize),
    );
    // SAFETY: `same` is live with 10 bytes.
    unsafe { pool.deallocate(same.as_ptr(), 10) };

    let big = pool.allocate(200)?;
    // SAFETY: `big` is live with 200 bytes.
    unsafe {
        for i in 0..200 {
            *big.as_ptr().add(i) = i as u8;
        }
    }
    let before = pool.system().snapshot();
    // SAFETY: `big` is live with 200 bytes.
    let small = unsafe { pool.reallocate(big.as_ptr(), 200, 10) }?;
    let after = pool.system().snapshot();

    checks.check("moved", small != big, "oversized to pooled returns a new block");
    // SAFETY: `small` is live with at least 10 bytes.
    let prefix = unsafe { std::slice::from_raw_parts(small.as_ptr(), 10) };
    checks.check(
        "prefix_preserved",
        prefix.iter().enumerate().all(|(i, &b)| b == i as u8),
        format!("{prefix:?}"),
    );
    checks.check(
        "old_block_released",
        after.deallocate_calls == before.deallocate_calls + 1,
        format!(
            "backend frees {} -> {}",
            before.deallocate_calls, after.deallocate_calls
        ),
    );
    // SAFETY: `small` is live with 10 bytes.
    unsafe { pool.deallocate(small.as_ptr(), 10) };
    Ok(pool)
}

fn pressure(
    config: PoolConfig,
    budget: usize,
    checks: &mut Checks,
) -> Result<Pool<MeteredHeap>, HarnessError> {
    let mut pool = Pool::with_system(MeteredHeap::with_budget(budget), config);
    let sizes = [8, 24, 64, 128, 40, 16];
    let mut held = Vec::new();
    let mut failed_size = None;

    for i in 0.. {
        let bytes = sizes[i % sizes.len()];
        match pool.allocate(bytes) {
            Ok(ptr) => held.push((ptr.as_ptr() as usize, bytes)),
            Err(PoolError::OutOfMemory { .. }) => {
                failed_size = Some(bytes);
                break;
            }
            Err(err) => return Err(err.into()),
        }
        if held.len() > budget {
            break;
        }
    }
    checks.check(
        "exhaustion_reported",
        failed_size.is_some(),
        format!("{} blocks held at {budget}-byte budget", held.len()),
    );
    let Some(failed_size) = failed_size else {
        return Ok(pool);
    };

    let free_before: Vec<usize> = (0..NUM_SIZE_CLASSES).map(|c| pool.free_count(c)).collect();
    let acquired = pool.total_acquired();
    let repeat = pool.allocate(failed_size);
    let free_after: Vec<usize> = (0..NUM_SIZE_CLASSES).map(|c| pool.free_count(c)).collect();
    checks.check(
        "failure_publishes_nothing",
        repeat.is_err() && free_before == free_after && pool.total_acquired() == acquired,
        format!("retry of {failed_size} bytes: {:?}", repeat.err()),
    );

    let stats = pool.stats();
    let peak = pool.system().snapshot().peak_bytes;
    checks.check(
        "within_budget",
        peak <= budget,
        format!(
            "peak {peak} bytes; {} scavenges, {} direct fallbacks",
            stats.scavenges, stats.direct_fallbacks
        ),
    );

    // Freeing half the blocks must let the same sizes succeed without growth.
    let mut released = 0;
    for (i, &(addr, bytes)) in held.iter().enumerate() {
        if i % 2 == 0 {
            // SAFETY: live block of `bytes` from this pool.
            unsafe { pool.deallocate(addr as *mut u8, bytes) };
            released += 1;
        }
    }
    let mut recovered = 0;
    for (i, &(_, bytes)) in held.iter().enumerate() {
        if i % 2 == 0 && pool.allocate(bytes).is_ok() {
            recovered += 1;
        }
    }
    checks.check(
        "recovers_after_free",
        recovered == released && pool.total_acquired() == acquired,
        format!("{recovered}/{released} re-served from free lists"),
    );
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallobj_core::PoolMode;

    #[test]
    fn scenario_names_round_trip() {
        for scenario in Scenario::all() {
            assert_eq!(Scenario::from_str_loose(scenario.as_str()), Some(scenario));
        }
        assert_eq!(Scenario::from_str_loose("OOM"), Some(Scenario::Pressure));
        assert_eq!(Scenario::from_str_loose("defrag"), None);
    }

    #[test]
    fn every_scenario_passes_in_both_modes() {
        for mode in [PoolMode::Strict, PoolMode::Hardened] {
            let config = PoolConfig::default().with_mode(mode);
            for scenario in Scenario::all() {
                let report = run_scenario(scenario, config, None).unwrap();
                assert!(
                    report.passed,
                    "{} ({}) failed: {:?}",
                    scenario.as_str(),
                    mode.as_str(),
                    report.checks
                );
                assert!(!report.checks.is_empty());
            }
        }
    }

    #[test]
    fn burst_ignores_configured_batch() {
        let config = PoolConfig::default().with_objects_per_refill(7);
        let report = run_scenario(Scenario::Burst, config, None).unwrap();
        assert!(report.passed, "{:?}", report.checks);
        assert_eq!(report.total_acquired, 640 + 680 + 728);
    }

    #[test]
    fn pressure_with_tiny_budget() {
        let report = run_scenario(Scenario::Pressure, PoolConfig::default(), Some(512)).unwrap();
        assert!(report.passed, "{:?}", report.checks);
        assert!(report.stats.out_of_memory >= 2);
    }
}
