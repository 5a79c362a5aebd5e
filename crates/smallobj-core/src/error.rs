//! Allocation error types.

use thiserror::Error;

/// Failure surfaced by the pool.
///
/// A failed call hands out no block and links none of the failed request's
/// memory onto a free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The system allocator could not supply memory and no larger free
    /// block could be scavenged.
    #[error("out of memory: could not obtain {bytes} bytes")]
    OutOfMemory { bytes: usize },
    /// The request exceeds `isize::MAX` bytes and never reaches the system.
    #[error("allocation size overflow for {bytes} bytes")]
    CapacityOverflow { bytes: usize },
    /// Hardened mode: the pointer is not a live block of this pool.
    #[error("pointer {addr:#x} is not a live block of this pool")]
    ForeignPointer { addr: usize },
}

impl PoolError {
    /// Number of bytes the failed request asked for, if it was a size failure.
    #[must_use]
    pub const fn bytes(self) -> Option<usize> {
        match self {
            Self::OutOfMemory { bytes } | Self::CapacityOverflow { bytes } => Some(bytes),
            Self::ForeignPointer { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = PoolError::OutOfMemory { bytes: 64 };
        assert_eq!(err.to_string(), "out of memory: could not obtain 64 bytes");
        let err = PoolError::CapacityOverflow { bytes: usize::MAX };
        assert!(err.to_string().contains("overflow"));
    }

    #[test]
    fn test_bytes() {
        assert_eq!(PoolError::OutOfMemory { bytes: 24 }.bytes(), Some(24));
        assert_eq!(PoolError::CapacityOverflow { bytes: 7 }.bytes(), Some(7));
        assert_eq!(PoolError::ForeignPointer { addr: 0x10 }.bytes(), None);
        assert_eq!(
            PoolError::ForeignPointer { addr: 0x10 }.to_string(),
            "pointer 0x10 is not a live block of this pool"
        );
    }
}
