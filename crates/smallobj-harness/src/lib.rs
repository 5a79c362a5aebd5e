//! Workload replay and invariant harness for smallobj.
//!
//! This crate provides:
//! - Workload replay: seeded allocate/free/reallocate mixes with per-step
//!   invariant checks
//! - Scenarios: the fixed burst, reuse, reallocate and pressure checks
//! - Structured logging: JSONL records for pool lifecycle events and run summaries

#![deny(unsafe_code)]

pub mod error;
pub mod scenario;
pub mod structured_log;
pub mod workload;

pub use error::HarnessError;
pub use scenario::{Scenario, ScenarioReport};
pub use workload::{WorkloadReport, WorkloadSpec};
