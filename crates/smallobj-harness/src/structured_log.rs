//! JSONL run logs.
//!
//! Every line is one [`LogEntry`]. Pool lifecycle records are lifted with
//! [`LogEntry::from_pool_record`]; run summaries and scenario results are
//! built directly. [`LogEmitter`] numbers entries into trace ids of the form
//! `smallobj::<run_id>::<seq>`, and [`validate_log_line`] /
//! [`validate_log_file`] check files written by earlier runs.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use smallobj_core::{PoolLogLevel, PoolLogRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<PoolLogLevel> for LogLevel {
    fn from(level: PoolLogLevel) -> Self {
        match level {
            PoolLogLevel::Trace => Self::Trace,
            PoolLogLevel::Debug => Self::Debug,
            PoolLogLevel::Info => Self::Info,
            PoolLogLevel::Warn => Self::Warn,
            PoolLogLevel::Error => Self::Error,
        }
    }
}

/// Verdict attached to summary and scenario entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
    Error,
}

/// Source of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Pool,
    Workload,
    Scenario,
}

/// One line of a run log.
///
/// `timestamp`, `trace_id`, `level` and `event` are always present; the rest
/// are skipped when unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub trace_id: String,
    pub level: LogLevel,
    pub event: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<Component>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// `allocate`, `deallocate` or `reallocate`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,
    /// Lifecycle outcome label (`free_list_hit`, `partial`, `fallback`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_outcome: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    /// Sequence number assigned by the pool's lifecycle log.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Hex address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ptr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub objects: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_acquired: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arena_remaining: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl LogEntry {
    #[must_use]
    pub fn new(trace_id: impl Into<String>, level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            timestamp: now_utc(),
            trace_id: trace_id.into(),
            level,
            event: event.into(),
            component: None,
            mode: None,
            op: None,
            pool_outcome: None,
            outcome: None,
            seq: None,
            ptr: None,
            bytes: None,
            class: None,
            objects: None,
            total_acquired: None,
            arena_remaining: None,
            duration_ms: None,
            details: None,
        }
    }

    /// Entry for one pool lifecycle record, with an empty trace id that the
    /// emitter assigns.
    #[must_use]
    pub fn from_pool_record(record: &PoolLogRecord) -> Self {
        Self {
            op: Some(record.op.to_string()),
            pool_outcome: Some(record.outcome.to_string()),
            seq: Some(record.seq),
            ptr: record.ptr.map(|addr| format!("{addr:#x}")),
            bytes: record.bytes,
            class: record.class,
            objects: record.objects,
            total_acquired: Some(record.total_acquired),
            arena_remaining: Some(record.arena_remaining),
            ..Self::new(String::new(), record.level.into(), record.event)
                .with_component(Component::Pool)
        }
    }

    #[must_use]
    pub fn with_component(mut self, component: Component) -> Self {
        self.component = Some(component);
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    #[must_use]
    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    #[must_use]
    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    /// Attaches a serialized report or error context.
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Numbers entries and writes them one per line.
pub struct LogEmitter<W: Write = Box<dyn Write>> {
    writer: W,
    seq: u64,
    run_id: String,
    mode: Option<String>,
}

impl LogEmitter {
    /// Buffered emitter writing to a freshly created `path`.
    pub fn to_file(path: &Path, run_id: &str) -> std::io::Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self::new(Box::new(std::io::BufWriter::new(file)), run_id))
    }

    #[must_use]
    pub fn to_stdout(run_id: &str) -> Self {
        Self::new(Box::new(std::io::stdout()), run_id)
    }
}

impl<W: Write> LogEmitter<W> {
    #[must_use]
    pub fn new(writer: W, run_id: &str) -> Self {
        Self {
            writer,
            seq: 0,
            run_id: run_id.to_string(),
            mode: None,
        }
    }

    /// Mode written on entries that do not name one.
    #[must_use]
    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    fn next_trace_id(&mut self) -> String {
        self.seq += 1;
        format!("smallobj::{}::{:03}", self.run_id, self.seq)
    }

    pub fn emit(&mut self, level: LogLevel, event: &str) -> std::io::Result<LogEntry> {
        self.emit_entry(LogEntry::new(String::new(), level, event))
    }

    /// Writes `entry`, filling in the trace id and mode when missing, and
    /// returns what was written.
    pub fn emit_entry(&mut self, mut entry: LogEntry) -> std::io::Result<LogEntry> {
        if entry.trace_id.is_empty() {
            entry.trace_id = self.next_trace_id();
        }
        if entry.mode.is_none() {
            entry.mode.clone_from(&self.mode);
        }
        let line = entry.to_jsonl().map_err(std::io::Error::other)?;
        writeln!(self.writer, "{line}")?;
        Ok(entry)
    }

    /// Writes one line per record; returns how many were written.
    pub fn emit_pool_records<'a>(
        &mut self,
        records: impl IntoIterator<Item = &'a PoolLogRecord>,
    ) -> std::io::Result<usize> {
        let mut count = 0;
        for record in records {
            self.emit_entry(LogEntry::from_pool_record(record))?;
            count += 1;
        }
        Ok(count)
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }

    #[must_use]
    pub fn emitted(&self) -> u64 {
        self.seq
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// A problem found in one line of a run log.
#[derive(Debug, Error)]
#[error("line {line_number}: {field}: {message}")]
pub struct LogValidationError {
    pub line_number: usize,
    pub field: String,
    pub message: String,
}

/// Lifecycle events a pool record may carry.
const POOL_EVENTS: &[&str] = &[
    "alloc",
    "free",
    "free_null",
    "realloc",
    "refill",
    "chunk_carve",
    "chunk_partial",
    "leftover_donated",
    "arena_grow",
    "arena_grow_failed",
    "scavenge",
    "direct_fallback",
    "oom",
    "size_mismatch_repaired",
    "unknown_pointer_ignored",
    "foreign_pointer_rejected",
];

/// Closed vocabularies for string fields, checked when the field is present.
const VOCABULARIES: &[(&str, &[&str])] = &[
    ("level", &["trace", "debug", "info", "warn", "error"]),
    ("mode", &["strict", "hardened"]),
    ("outcome", &["pass", "fail", "error"]),
    ("component", &["pool", "workload", "scenario"]),
];

/// Checks one line and parses it.
///
/// All problems on the line are reported together.
pub fn validate_log_line(
    line: &str,
    line_number: usize,
) -> Result<LogEntry, Vec<LogValidationError>> {
    let issue = |field: &str, message: String| LogValidationError {
        line_number,
        field: field.to_string(),
        message,
    };

    let value: Value = serde_json::from_str(line)
        .map_err(|e| vec![issue("<json>", format!("not JSON: {e}"))])?;
    let Some(obj) = value.as_object() else {
        return Err(vec![issue("<root>", "not an object".to_string())]);
    };

    let mut errors: Vec<LogValidationError> = ["timestamp", "trace_id", "level", "event"]
        .into_iter()
        .filter(|field| !obj.contains_key(*field))
        .map(|field| issue(field, "missing".to_string()))
        .collect();

    for &(field, allowed) in VOCABULARIES {
        if let Some(found) = str_field(obj, field)
            && !allowed.contains(&found)
        {
            errors.push(issue(field, format!("'{found}' is not one of {allowed:?}")));
        }
    }

    if str_field(obj, "component") == Some("pool") {
        if let Some(event) = str_field(obj, "event")
            && !POOL_EVENTS.contains(&event)
        {
            errors.push(issue("event", format!("'{event}' is not a pool lifecycle event")));
        }
        errors.extend(
            ["op", "total_acquired", "arena_remaining"]
                .into_iter()
                .filter(|field| !obj.contains_key(*field))
                .map(|field| issue(field, "missing on a pool record".to_string())),
        );
    }

    if let Some(trace_id) = str_field(obj, "trace_id")
        && trace_id.split("::").count() != 3
    {
        errors.push(issue(
            "trace_id",
            format!("expected smallobj::<run_id>::<seq>, got '{trace_id}'"),
        ));
    }

    if !errors.is_empty() {
        return Err(errors);
    }
    serde_json::from_value(value).map_err(|e| vec![issue("<entry>", e.to_string())])
}

fn str_field<'a>(obj: &'a Map<String, Value>, field: &str) -> Option<&'a str> {
    obj.get(field).and_then(Value::as_str)
}

/// Checks every non-blank line of `path`; returns the line count and all
/// problems found.
pub fn validate_log_file(path: &Path) -> Result<(usize, Vec<LogValidationError>), std::io::Error> {
    let content = std::fs::read_to_string(path)?;
    let mut errors = Vec::new();
    let mut lines = 0;

    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        lines += 1;
        if let Err(found) = validate_log_line(line, i + 1) {
            errors.extend(found);
        }
    }

    Ok((lines, errors))
}

/// UTC timestamp, `YYYY-MM-DDTHH:MM:SS.mmmZ`.
pub(crate) fn now_utc() -> String {
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = duration.as_secs();
    let (year, month, day) = civil_from_days((secs / 86_400) as i64);
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{:03}Z",
        (secs % 86_400) / 3600,
        (secs % 3600) / 60,
        secs % 60,
        duration.subsec_millis(),
    )
}

/// Proleptic Gregorian date for a day count since 1970-01-01.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}
