//! # smallobj-core
//!
//! Small-object pool allocator.
//!
//! Requests up to [`pool::size_class::MAX_BYTES`] bytes are served from one
//! segregated free list per 8-byte size class. Empty lists are refilled in
//! batches carved from a private heap arena that grows geometrically from the
//! system allocator. Larger requests pass straight through to the system
//! allocator.
//!
//! A [`Pool`] is an explicitly constructed, single-owner value. Wrap it in a
//! [`SharedPool`] when it must be reached from more than one thread.
//!
//! `unsafe` is denied at the crate level and re-allowed only in the modules
//! that reinterpret raw block memory.

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod pool;
pub mod shared;

pub use config::{PoolConfig, PoolMode};
pub use error::PoolError;
pub use pool::log::{PoolLogLevel, PoolLogRecord};
pub use pool::system::{MeteredHeap, SystemAlloc, SystemHeap};
pub use pool::{Pool, PoolStats};
pub use shared::{SharedPool, global};
