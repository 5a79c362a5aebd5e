//! Small-object pool.
//!
//! Two tiers:
//! - Requests up to `MAX_BYTES`: popped from a per-size-class free list,
//!   refilled in batches carved from the heap arena
//! - Larger requests: forwarded unchanged to the system allocator

pub mod allocator;
pub mod arena;
mod chunk;
pub mod free_list;
pub mod log;
pub mod size_class;
pub mod system;

pub use allocator::{Pool, PoolStats};
pub use arena::HeapArena;
pub use free_list::FreeLists;
pub use size_class::{ALIGN, MAX_BYTES, NUM_SIZE_CLASSES};
