use core::fmt;

use super::AllocError;

/// The ways a zone allocation can fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZoneError {
    /// The request (after rounding up to [`ZONE_ALIGN`][crate::ZONE_ALIGN])
    /// does not fit in a single block. This is a configuration error: the
    /// zone was built with blocks too small for its callers.
    Oversized {
        /// The rounded size that was requested.
        requested: usize,
        /// The zone's block size.
        block_size: usize,
    },

    /// The underlying allocator could not provide a new block.
    OutOfMemory,

    /// A typed allocation asked for an alignment the zone cannot provide.
    Misaligned {
        /// The alignment that was requested.
        align: usize,
    },
}

impl fmt::Display for ZoneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZoneError::Oversized {
                requested,
                block_size,
            } => write!(
                f,
                "cannot allocate {requested} bytes from a zone with {block_size}-byte blocks"
            ),
            ZoneError::OutOfMemory => f.write_str("underlying allocator failed to provide a block"),
            ZoneError::Misaligned { align } => write!(
                f,
                "alignment of {align:#x} exceeds the zone's alignment of {:#x}",
                crate::ZONE_ALIGN
            ),
        }
    }
}

impl From<AllocError> for ZoneError {
    #[inline]
    fn from(_: AllocError) -> Self {
        ZoneError::OutOfMemory
    }
}

impl core::error::Error for ZoneError {}
