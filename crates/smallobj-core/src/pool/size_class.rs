//! Size classes for pooled allocations.
//!
//! Sizes are rounded up to a multiple of `ALIGN`, giving `NUM_SIZE_CLASSES`
//! classes of 8, 16, ..., 128 bytes. Each class owns one free list, indexed
//! by `ceil(bytes / ALIGN) - 1`.

/// Granularity and minimum alignment of every pooled block (bytes).
pub const ALIGN: usize = 8;

/// Largest pooled request (bytes). Above this, use the system allocator.
pub const MAX_BYTES: usize = 128;

/// Number of size classes (and free lists).
pub const NUM_SIZE_CLASSES: usize = MAX_BYTES / ALIGN;

/// Maps a zero-byte request onto the smallest class.
#[inline]
pub const fn normalize(bytes: usize) -> usize {
    if bytes == 0 { 1 } else { bytes }
}

/// Rounds `bytes` up to the next multiple of `ALIGN`.
///
/// Returns `None` on overflow.
#[inline]
pub const fn round_up(bytes: usize) -> Option<usize> {
    match bytes.checked_add(ALIGN - 1) {
        Some(padded) => Some(padded & !(ALIGN - 1)),
        None => None,
    }
}

/// Returns true if a request of `bytes` is served from a free list.
#[inline]
pub const fn is_pooled(bytes: usize) -> bool {
    normalize(bytes) <= MAX_BYTES
}

/// Computes the free-list index for a pooled request.
///
/// Zero is treated as one byte. Sizes above `MAX_BYTES` return
/// `NUM_SIZE_CLASSES` to signal the passthrough path.
#[inline]
pub const fn class_index(bytes: usize) -> usize {
    let bytes = normalize(bytes);
    if bytes > MAX_BYTES {
        return NUM_SIZE_CLASSES;
    }
    bytes.div_ceil(ALIGN) - 1
}

/// Returns the block size for a class index, or 0 for out-of-range indices.
#[inline]
pub const fn class_size(index: usize) -> usize {
    if index < NUM_SIZE_CLASSES {
        (index + 1) * ALIGN
    } else {
        0
    }
}
