//! Handle encodings
//!
//! Two disjoint handle spaces share the positive `i32` range:
//!
//! - **Static handles** (bit 30 set) address stateless services. Bits 8..=12
//!   hold the stateless service index, bits 0..=7 the requested version.
//!   They never enter the connection registry.
//! - **Connection handles** (bit 30 clear) address registry records. Bits
//!   0..=7 hold the record index + 1, bits 8..=23 the record's generation,
//!   so a handle to a reclaimed record never aliases its next occupant.
//!   Bits 24..=29 must be clear.
//!
//! Zero is the null handle in both spaces.

use crate::config::{CONNECTION_POOL_SIZE, STATIC_HANDLE_NUM_LIMIT};

/// Client-visible handle
pub type PsaHandle = i32;

/// The null handle
pub const PSA_NULL_HANDLE: PsaHandle = 0;

const STATIC_HANDLE_INDICATOR: i32 = 1 << 30;
const STATIC_HANDLE_IDX_SHIFT: u32 = 8;
const STATIC_HANDLE_IDX_MASK: i32 = 0x1F;
const STATIC_HANDLE_VER_MASK: i32 = 0xFF;

const CONN_INDEX_MASK: i32 = 0xFF;
const CONN_GEN_SHIFT: u32 = 8;
const CONN_GEN_MASK: i32 = 0xFFFF;

/// Decoded view of a raw handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// [`PSA_NULL_HANDLE`]
    Null,
    /// Stateless service handle
    Static {
        /// Index into the stateless service table
        index: usize,
        /// Version requested by the client
        version: u32,
    },
    /// Connection registry handle
    Connection {
        /// Registry index
        index: usize,
        /// Generation of the record when the handle was issued
        generation: u16,
    },
    /// Negative values and malformed encodings
    Invalid,
}

impl HandleKind {
    /// Classify a raw handle
    pub const fn classify(handle: PsaHandle) -> Self {
        if handle == PSA_NULL_HANDLE {
            return Self::Null;
        }
        if handle < 0 {
            return Self::Invalid;
        }
        if is_static_handle(handle) {
            return Self::Static {
                index: static_handle_index(handle),
                version: static_handle_version(handle),
            };
        }
        if handle & !(CONN_INDEX_MASK | (CONN_GEN_MASK << CONN_GEN_SHIFT)) != 0 {
            return Self::Invalid;
        }
        let raw_index = handle & CONN_INDEX_MASK;
        if raw_index == 0 || (raw_index as usize) > CONNECTION_POOL_SIZE {
            return Self::Invalid;
        }
        Self::Connection {
            index: (raw_index - 1) as usize,
            generation: ((handle >> CONN_GEN_SHIFT) & CONN_GEN_MASK) as u16,
        }
    }
}

/// True for handles in the stateless space
#[inline]
pub const fn is_static_handle(handle: PsaHandle) -> bool {
    handle > 0 && (handle & STATIC_HANDLE_INDICATOR) != 0
}

/// Build the static handle of stateless service `index` at `version`
///
/// # Panics
/// Panics if `index` exceeds the static handle space.
pub const fn static_handle(index: usize, version: u8) -> PsaHandle {
    assert!(index < STATIC_HANDLE_NUM_LIMIT);
    STATIC_HANDLE_INDICATOR
        | (((index as i32) & STATIC_HANDLE_IDX_MASK) << STATIC_HANDLE_IDX_SHIFT)
        | (version as i32 & STATIC_HANDLE_VER_MASK)
}

/// Stateless service index carried by a static handle
#[inline]
pub const fn static_handle_index(handle: PsaHandle) -> usize {
    ((handle >> STATIC_HANDLE_IDX_SHIFT) & STATIC_HANDLE_IDX_MASK) as usize
}

/// Version carried by a static handle
#[inline]
pub const fn static_handle_version(handle: PsaHandle) -> u32 {
    (handle & STATIC_HANDLE_VER_MASK) as u32
}

/// Build a connection handle for registry slot `index`
pub(crate) const fn connection_handle(index: usize, generation: u16) -> PsaHandle {
    (((generation as i32) & CONN_GEN_MASK) << CONN_GEN_SHIFT)
        | (((index + 1) as i32) & CONN_INDEX_MASK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_handle_layout() {
        let handle = static_handle(3, 2);
        assert!(is_static_handle(handle));
        assert_eq!(handle, 0x4000_0302);
        assert_eq!(
            HandleKind::classify(handle),
            HandleKind::Static { index: 3, version: 2 }
        );
    }

    #[test]
    fn test_connection_handles_stay_out_of_static_space() {
        for index in 0..CONNECTION_POOL_SIZE {
            for generation in [0u16, 1, 0x7FFF, 0xFFFF] {
                let handle = connection_handle(index, generation);
                assert!(handle > 0);
                assert!(!is_static_handle(handle));
                assert_eq!(
                    HandleKind::classify(handle),
                    HandleKind::Connection { index, generation }
                );
            }
        }
    }

    #[test]
    fn test_classify_rejects_garbage() {
        assert_eq!(HandleKind::classify(PSA_NULL_HANDLE), HandleKind::Null);
        assert_eq!(HandleKind::classify(-1), HandleKind::Invalid);
        assert_eq!(HandleKind::classify(i32::MIN), HandleKind::Invalid);
        // Index byte of zero is never issued
        assert_eq!(HandleKind::classify(0x100), HandleKind::Invalid);
        // Index beyond the pool
        assert_eq!(HandleKind::classify(0xFF), HandleKind::Invalid);
        // Bits above the generation are never issued
        assert_eq!(HandleKind::classify(0x3F00_0001), HandleKind::Invalid);
        assert_eq!(HandleKind::classify(0x0100_0001), HandleKind::Invalid);
        assert_eq!(
            HandleKind::classify(0x00FF_FF01),
            HandleKind::Connection { index: 0, generation: 0xFFFF }
        );
    }
}
