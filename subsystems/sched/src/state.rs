//! # Compute-Unit State

/// State of a single compute unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CunitState {
    /// Available for acquisition
    Free = 0,
    /// Held by exactly one requester
    Busy = 1,
}

impl CunitState {
    /// Decode the raw value stored in the per-cunit atomic
    #[inline]
    ///
    /// Only values produced by [`as_raw`](Self::as_raw) are ever stored.
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Free,
            1 => Self::Busy,
            _ => {
                debug_assert!(false, "invalid cunit state {}", raw);
                Self::Free
            },
        }
    }

    /// Raw value stored in the per-cunit atomic
    #[inline]
    pub const fn as_raw(self) -> u8 {
        self as u8
    }

    /// Check if the cunit is held
    #[inline]
    pub const fn is_busy(self) -> bool {
        matches!(self, Self::Busy)
    }
}

/// Diagnostic view of one compute unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CunitInfo {
    /// Cunit index
    pub id: u8,
    /// Current state
    pub state: CunitState,
    /// Successful acquisitions since creation or the last reset
    pub acquisition_count: u64,
}
