//! Pool lifecycle records.
//!
//! The pool records notable decisions (refills, arena growth, scavenging,
//! out-of-memory, contract repairs) into a bounded in-memory log. Records
//! hold only integers and static labels, so recording never allocates once
//! the ring is full, and records below the configured level are skipped
//! before they are built.

use std::collections::VecDeque;

/// Lifecycle record severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PoolLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl PoolLogLevel {
    /// Parse from string (case-insensitive). Unknown values select `Info`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "warn" | "warning" => Self::Warn,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Structured pool lifecycle record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLogRecord {
    /// Monotonic sequence number, unique per pool.
    pub seq: u64,
    pub level: PoolLogLevel,
    /// Public operation that triggered the record (`allocate`, `deallocate`, `reallocate`).
    pub op: &'static str,
    /// Event kind (`refill`, `arena_grow`, `scavenge`, ...).
    pub event: &'static str,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    pub ptr: Option<usize>,
    pub bytes: Option<usize>,
    /// Size-class index (`NUM_SIZE_CLASSES` for passthrough requests).
    pub class: Option<usize>,
    /// Object count for batch events.
    pub objects: Option<usize>,
    /// Snapshot: bytes ever requested from the system allocator.
    pub total_acquired: usize,
    /// Snapshot: unconsumed arena bytes.
    pub arena_remaining: usize,
}

/// Event-specific fields of a record; the pool fills in the rest.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Fields {
    pub ptr: Option<usize>,
    pub bytes: Option<usize>,
    pub class: Option<usize>,
    pub objects: Option<usize>,
}

impl Fields {
    pub(crate) const fn bytes(bytes: usize) -> Self {
        Self {
            ptr: None,
            bytes: Some(bytes),
            class: None,
            objects: None,
        }
    }

    pub(crate) const fn ptr(mut self, ptr: usize) -> Self {
        self.ptr = Some(ptr);
        self
    }

    pub(crate) const fn class(mut self, class: usize) -> Self {
        self.class = Some(class);
        self
    }

    pub(crate) const fn objects(mut self, objects: usize) -> Self {
        self.objects = Some(objects);
        self
    }
}

/// Bounded ring of lifecycle records.
#[derive(Debug)]
pub struct LifecycleLog {
    records: VecDeque<PoolLogRecord>,
    capacity: usize,
    min_level: PoolLogLevel,
    next_seq: u64,
    dropped: u64,
}

impl LifecycleLog {
    #[must_use]
    pub fn new(min_level: PoolLogLevel, capacity: usize) -> Self {
        Self {
            records: VecDeque::new(),
            capacity,
            min_level,
            next_seq: 1,
            dropped: 0,
        }
    }

    /// Returns true if records at `level` are kept.
    #[inline]
    #[must_use]
    pub fn enabled(&self, level: PoolLogLevel) -> bool {
        self.capacity > 0 && level >= self.min_level
    }

    pub(crate) fn push(&mut self, mut record: PoolLogRecord) {
        record.seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        if self.records.len() == self.capacity {
            self.records.pop_front();
            self.dropped += 1;
        }
        self.records.push_back(record);
    }

    /// Records currently retained, oldest first.
    pub fn records(&self) -> impl ExactSizeIterator<Item = &PoolLogRecord> + '_ {
        self.records.iter()
    }

    /// Removes and returns all retained records.
    pub fn drain(&mut self) -> Vec<PoolLogRecord> {
        self.records.drain(..).collect()
    }

    /// Records evicted because the ring was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    #[must_use]
    pub fn min_level(&self) -> PoolLogLevel {
        self.min_level
    }
}
