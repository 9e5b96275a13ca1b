//! # PNM Error Handling
//!
//! Error taxonomy shared by the allocator, the scheduler and the registry.
//!
//! - Errors are typed and returned synchronously to the immediate caller
//! - No panics in request paths
//! - Errors are `no_std` compatible and `Copy`, so they can be relayed across
//!   the device boundary unchanged

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// PNM Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// PNM unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Error {
    /// Bad index, malformed range, unsupported mask or non-power-of-two
    /// granularity
    InvalidArgument,
    /// No sufficiently large free region in the targeted pool
    OutOfMemory,
    /// Unknown allocation, cunit or shared address
    NotFound,
    /// Duplicate shared registry entry
    AlreadyExists,
    /// Bounded wait for a compute unit expired
    Timeout,
    /// Operation conflicts with the current state (e.g. double release)
    InvalidState,
}

impl Error {
    /// Negative errno reported to the request-handling layer.
    pub const fn errno(self) -> i32 {
        match self {
            Self::InvalidArgument => -22, // EINVAL
            Self::OutOfMemory => -12,     // ENOMEM
            Self::NotFound => -2,         // ENOENT
            Self::AlreadyExists => -17,   // EEXIST
            Self::Timeout => -110,        // ETIMEDOUT
            Self::InvalidState => -16,    // EBUSY
        }
    }

    /// Short, stable name of the error kind.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid argument",
            Self::OutOfMemory => "out of memory",
            Self::NotFound => "not found",
            Self::AlreadyExists => "already exists",
            Self::Timeout => "timed out",
            Self::InvalidState => "invalid state",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
