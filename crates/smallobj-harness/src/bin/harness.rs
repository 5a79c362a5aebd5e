//! CLI entrypoint for the smallobj harness.

use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Args, Parser, Subcommand};

use smallobj_core::{PoolConfig, PoolLogLevel, PoolMode};
use smallobj_harness::error::parse_seed;
use smallobj_harness::scenario::{self, Scenario};
use smallobj_harness::structured_log::{
    Component, LogEmitter, LogEntry, LogLevel, Outcome, validate_log_file,
};
use smallobj_harness::workload::{self, WorkloadSpec};
use smallobj_harness::HarnessError;

/// Workload replay and invariant checks for the smallobj pool.
#[derive(Debug, Parser)]
#[command(name = "smallobj-harness")]
#[command(about = "Workload replay and invariant harness for smallobj")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// Pool settings shared by every command.
#[derive(Debug, Args)]
struct PoolArgs {
    /// Contract-checking mode (strict or hardened).
    #[arg(long, default_value = "strict")]
    mode: String,
    /// Objects carved per refill (clamped to 1..=512).
    #[arg(long, default_value_t = smallobj_core::config::DEFAULT_OBJECTS_PER_REFILL)]
    batch: usize,
    /// Byte budget for the system allocator (unlimited if omitted).
    #[arg(long)]
    budget: Option<usize>,
    /// Minimum lifecycle record level forwarded to the log.
    #[arg(long, default_value = "info")]
    log_level: String,
    /// JSONL output path (if omitted, prints to stdout).
    #[arg(long)]
    output: Option<PathBuf>,
}

impl PoolArgs {
    fn config(&self) -> PoolConfig {
        PoolConfig::default()
            .with_mode(PoolMode::from_str_loose(&self.mode))
            .with_objects_per_refill(self.batch)
            .with_log_level(PoolLogLevel::from_str_loose(&self.log_level))
    }

    fn emitter(&self, run_id: &str) -> std::io::Result<LogEmitter> {
        let emitter = match &self.output {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                LogEmitter::to_file(path, run_id)?
            }
            None => LogEmitter::to_stdout(run_id),
        };
        Ok(emitter.with_mode(self.config().mode.as_str()))
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Replay a seeded allocate/free/reallocate workload.
    Run {
        #[command(flatten)]
        pool: PoolArgs,
        /// Root seed (decimal or 0x...).
        #[arg(long, default_value = "0xDEAD_BEEF")]
        seed: String,
        /// Number of workload steps.
        #[arg(long, default_value_t = 10_000)]
        steps: usize,
        /// Concurrently tracked blocks.
        #[arg(long, default_value_t = 64)]
        slots: usize,
    },
    /// Run a fixed scenario (burst, reuse, realloc, pressure, or all).
    Scenario {
        name: String,
        #[command(flatten)]
        pool: PoolArgs,
    },
    /// Validate a JSONL log written by `run` or `scenario`.
    ValidateLog {
        #[arg(long)]
        input: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            pool,
            seed,
            steps,
            slots,
        } => {
            let seed = parse_seed(&seed)?;
            let spec = WorkloadSpec {
                seed,
                steps,
                slots,
                budget: pool.budget,
                config: pool.config(),
            };
            let mut emitter = pool.emitter(&format!("run-{seed:x}"))?;
            let started = Instant::now();

            let mut io_error = None;
            let result = workload::run(&spec, |record| {
                if io_error.is_none()
                    && let Err(err) = emitter.emit_entry(LogEntry::from_pool_record(record))
                {
                    io_error = Some(err);
                }
            });
            if let Some(err) = io_error {
                return Err(err.into());
            }

            let elapsed = started.elapsed().as_millis() as u64;
            match result {
                Ok(report) => {
                    emitter.emit_entry(
                        LogEntry::new(String::new(), LogLevel::Info, "workload_summary")
                            .with_component(Component::Workload)
                            .with_outcome(Outcome::Pass)
                            .with_duration_ms(elapsed)
                            .with_details(serde_json::to_value(&report)?),
                    )?;
                    emitter.flush()?;
                    eprintln!(
                        "seed {seed:#x}: {} steps, {} checks passed, {} oom, {} bytes acquired",
                        report.steps, report.checks, report.oom_events, report.total_acquired
                    );
                }
                Err(err) => {
                    emitter.emit_entry(
                        LogEntry::new(String::new(), LogLevel::Error, "workload_failed")
                            .with_component(Component::Workload)
                            .with_outcome(failure_outcome(&err))
                            .with_duration_ms(elapsed)
                            .with_details(serde_json::json!({
                                "seed": seed,
                                "error": err.to_string(),
                            })),
                    )?;
                    emitter.flush()?;
                    return Err(err.into());
                }
            }
        }
        Command::Scenario { name, pool } => {
            let scenarios: Vec<Scenario> = if name.eq_ignore_ascii_case("all") {
                Scenario::all().to_vec()
            } else {
                vec![
                    Scenario::from_str_loose(&name)
                        .ok_or_else(|| HarnessError::UnknownScenario(name.clone()))?,
                ]
            };
            let mut emitter = pool.emitter(&format!("scenario-{}", name.to_ascii_lowercase()))?;
            let mut failed = Vec::new();

            for scenario in scenarios {
                let report = scenario::run_scenario(scenario, pool.config(), pool.budget)?;
                let (level, outcome) = if report.passed {
                    (LogLevel::Info, Outcome::Pass)
                } else {
                    failed.push(scenario.as_str());
                    (LogLevel::Error, Outcome::Fail)
                };
                emitter.emit_entry(
                    LogEntry::new(String::new(), level, "scenario_result")
                        .with_component(Component::Scenario)
                        .with_outcome(outcome)
                        .with_details(serde_json::to_value(&report)?),
                )?;
                for check in &report.checks {
                    eprintln!(
                        "[{}] {}/{}: {}",
                        if check.passed { "PASS" } else { "FAIL" },
                        scenario.as_str(),
                        check.name,
                        check.detail
                    );
                }
            }
            emitter.flush()?;
            if !failed.is_empty() {
                return Err(format!("scenarios failed: {}", failed.join(", ")).into());
            }
        }
        Command::ValidateLog { input } => validate(&input)?,
    }

    Ok(())
}

fn failure_outcome(err: &HarnessError) -> Outcome {
    match err {
        HarnessError::InvariantViolated { .. } => Outcome::Fail,
        _ => Outcome::Error,
    }
}

fn validate(input: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let (lines, errors) = validate_log_file(input)?;
    if errors.is_empty() {
        eprintln!("{}: {lines} lines valid", input.display());
        return Ok(());
    }
    for err in &errors {
        eprintln!("{err}");
    }
    Err(format!(
        "{}: {} errors in {lines} lines",
        input.display(),
        errors.len()
    )
    .into())
}
