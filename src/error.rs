// FASTPATH — ERROR TAXONOMY
// The hot path never unwinds across the boundary: recoverable conditions
// (Full, Empty, WouldBlock) map to the try-again return code and are never
// logged; real failures map to negative codes.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Caller-supplied argument out of contract.
    InvalidArgument,
    /// Allocation failed.
    OutOfMemory,
    /// Ring has no free slot; back off or drop.
    Full,
    /// Ring has nothing published.
    Empty,
    /// Non-blocking operation would block.
    WouldBlock,
    /// Deadline elapsed before completion.
    Timeout,
    /// Subsystem is shut down or shutting down.
    Closed,
    /// No free slot in the requested class.
    Exhausted,
    /// Required capability or primitive is unavailable.
    Unsupported,
    /// Crypto job completed with a failure marker; output is undefined.
    Failed,
    /// OS-level failure carrying the errno.
    System(i32),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::OutOfMemory => write!(f, "out of memory"),
            Error::Full => write!(f, "ring full"),
            Error::Empty => write!(f, "ring empty"),
            Error::WouldBlock => write!(f, "would block"),
            Error::Timeout => write!(f, "timed out"),
            Error::Closed => write!(f, "closed"),
            Error::Exhausted => write!(f, "pool exhausted"),
            Error::Unsupported => write!(f, "unsupported"),
            Error::Failed => write!(f, "job failed"),
            Error::System(e) => write!(f, "system error (errno {})", e),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Capture the calling thread's errno as a `System` error.
    pub fn last_os() -> Error {
        Error::System(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}

// ============================================================================
// BOUNDARY RETURN CODES
// Non-negative = success (often a length or handle), 0 = try again,
// negative = failure.
// ============================================================================

pub const RC_AGAIN: i64       = 0;
pub const RC_INVALID: i64     = -0x01;
pub const RC_NO_MEMORY: i64   = -0x02;
pub const RC_TIMEOUT: i64     = -0x03;
pub const RC_CLOSED: i64      = -0x04;
pub const RC_EXHAUSTED: i64   = -0x05;
pub const RC_UNSUPPORTED: i64 = -0x06;
pub const RC_FAILED: i64      = -0x07;
/// System errors encode as `RC_SYSTEM_BASE - errno`.
pub const RC_SYSTEM_BASE: i64 = -0x100;

impl Error {
    /// Boundary mapping. Recoverable conditions collapse to `RC_AGAIN`.
    pub fn code(&self) -> i64 {
        match self {
            Error::Full | Error::Empty | Error::WouldBlock => RC_AGAIN,
            Error::InvalidArgument => RC_INVALID,
            Error::OutOfMemory => RC_NO_MEMORY,
            Error::Timeout => RC_TIMEOUT,
            Error::Closed => RC_CLOSED,
            Error::Exhausted => RC_EXHAUSTED,
            Error::Unsupported => RC_UNSUPPORTED,
            Error::Failed => RC_FAILED,
            Error::System(e) => RC_SYSTEM_BASE - (*e as i64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_conditions_map_to_try_again() {
        assert_eq!(Error::Full.code(), RC_AGAIN);
        assert_eq!(Error::Empty.code(), RC_AGAIN);
        assert_eq!(Error::WouldBlock.code(), RC_AGAIN);
    }

    #[test]
    fn failures_are_negative_and_distinct() {
        let codes = [
            Error::InvalidArgument.code(),
            Error::OutOfMemory.code(),
            Error::Timeout.code(),
            Error::Closed.code(),
            Error::Exhausted.code(),
            Error::Unsupported.code(),
            Error::Failed.code(),
            Error::System(libc::EIO).code(),
        ];
        for (i, c) in codes.iter().enumerate() {
            assert!(*c < 0, "code {} not negative", c);
            for d in &codes[i + 1..] {
                assert_ne!(c, d);
            }
        }
    }

    #[test]
    fn system_code_carries_errno() {
        assert_eq!(Error::System(5).code(), RC_SYSTEM_BASE - 5);
    }
}
