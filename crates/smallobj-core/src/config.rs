//! Pool configuration.
//!
//! Defaults match the classic small-object allocator: 20 objects per refill,
//! strict contract checking, lifecycle records from `Info` upward.
//!
//! [`PoolConfig::from_env`] reads:
//! - `SMALLOBJ_MODE`: `strict` (default) or `hardened`.
//! - `SMALLOBJ_REFILL_BATCH`: objects carved per refill (clamped to `1..=512`).
//! - `SMALLOBJ_LOG_LEVEL`: minimum lifecycle record level.

use crate::pool::log::PoolLogLevel;

/// Objects carved per refill unless configured otherwise.
pub const DEFAULT_OBJECTS_PER_REFILL: usize = 20;

/// Upper bound on the refill batch.
pub const MAX_OBJECTS_PER_REFILL: usize = 512;

/// Default number of lifecycle records retained.
pub const DEFAULT_LOG_CAPACITY: usize = 1024;

/// Contract-checking mode.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolMode {
    /// Caller-supplied sizes are trusted. A mismatched size on deallocate is
    /// undefined behavior, as in the classic allocator.
    #[default]
    Strict,
    /// Every live block is tagged with its size class. Mismatched sizes are
    /// repaired using the tag and unknown pointers are ignored; both are
    /// counted and logged.
    Hardened,
}

impl PoolMode {
    /// Parse from string (case-insensitive). Unknown values select `Strict`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "hardened" | "checked" | "debug" => Self::Hardened,
            _ => Self::Strict,
        }
    }

    /// Returns true if live blocks are tagged.
    #[must_use]
    pub const fn tags_live_blocks(self) -> bool {
        matches!(self, Self::Hardened)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Hardened => "hardened",
        }
    }
}

/// Tunables for a [`Pool`](crate::Pool).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Objects requested from the arena when a free list runs dry.
    pub objects_per_refill: usize,
    pub mode: PoolMode,
    /// Lifecycle records below this level are not recorded.
    pub log_level: PoolLogLevel,
    /// Maximum lifecycle records retained; oldest are dropped first.
    pub log_capacity: usize,
}

impl PoolConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            objects_per_refill: DEFAULT_OBJECTS_PER_REFILL,
            mode: PoolMode::Strict,
            log_level: PoolLogLevel::Info,
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }

    /// Build a config from `SMALLOBJ_*` environment variables.
    ///
    /// Missing or malformed values fall back to the defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::new();
        if let Some(mode) = lookup("SMALLOBJ_MODE") {
            config.mode = PoolMode::from_str_loose(&mode);
        }
        if let Some(batch) = lookup("SMALLOBJ_REFILL_BATCH")
            && let Ok(batch) = batch.trim().parse::<usize>()
        {
            config = config.with_objects_per_refill(batch);
        }
        if let Some(level) = lookup("SMALLOBJ_LOG_LEVEL") {
            config.log_level = PoolLogLevel::from_str_loose(&level);
        }
        config
    }

    /// Set the refill batch, clamped to `1..=MAX_OBJECTS_PER_REFILL`.
    #[must_use]
    pub const fn with_objects_per_refill(mut self, objects: usize) -> Self {
        self.objects_per_refill = if objects == 0 {
            1
        } else if objects > MAX_OBJECTS_PER_REFILL {
            MAX_OBJECTS_PER_REFILL
        } else {
            objects
        };
        self
    }

    #[must_use]
    pub const fn with_mode(mut self, mode: PoolMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub const fn with_log_level(mut self, level: PoolLogLevel) -> Self {
        self.log_level = level;
        self
    }

    #[must_use]
    pub const fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new()
    }
}
