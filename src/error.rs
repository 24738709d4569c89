//! Error types for `emds`.
//!
//! A single unified error type covers every container operation. Error codes follow the
//! pattern `EMD-XXX` for log correlation.

use thiserror::Error;

/// Result type alias for `emds` operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in `emds` operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Container is already open (EMD-001).
    #[error("[EMD-001] container at '{0}' is already open")]
    AlreadyOpen(String),

    /// Failed to open a container (EMD-002).
    #[error("[EMD-002] failed to open container at '{0}': {1}")]
    OpenFailure(String, String),

    /// Allocator or codec ran out of memory (EMD-003).
    #[error("[EMD-003] out of memory: {0}")]
    OutOfMemory(String),

    /// Size arithmetic overflowed (EMD-004).
    #[error("[EMD-004] size computation overflowed: {0}")]
    Overflow(String),

    /// An I/O operation failed (EMD-005).
    #[error("[EMD-005] I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// The codec failed to encode or decode a value (EMD-006).
    #[error("[EMD-006] codec error: {0}")]
    CodecError(String),

    /// A map lookup found no matching key (EMD-007).
    #[error("[EMD-007] key not found")]
    KeyNotFound,

    /// A sequence index was outside the valid range (EMD-008).
    #[error("[EMD-008] index {index} out of range for length {len}")]
    IndexOutOfRange {
        /// The index that was requested.
        index: i64,
        /// The sequence's length at the time of the request.
        len: u64,
    },

    /// A key of an unsupported type was used to index a sequence (EMD-009).
    #[error("[EMD-009] bad key type: {0}")]
    BadKeyType(String),

    /// Configuration failed to load or validate (EMD-010).
    #[error("[EMD-010] configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns the stable error code (e.g. `"EMD-001"`).
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::AlreadyOpen(_) => "EMD-001",
            Self::OpenFailure(..) => "EMD-002",
            Self::OutOfMemory(_) => "EMD-003",
            Self::Overflow(_) => "EMD-004",
            Self::IoError(_) => "EMD-005",
            Self::CodecError(_) => "EMD-006",
            Self::KeyNotFound => "EMD-007",
            Self::IndexOutOfRange { .. } => "EMD-008",
            Self::BadKeyType(_) => "EMD-009",
            Self::Config(_) => "EMD-010",
        }
    }

    /// Returns true if retrying the same operation could plausibly succeed.
    ///
    /// Corruption-adjacent errors (overflow, bad open) are not recoverable; transient
    /// I/O failures are left to the caller's judgement and reported as recoverable.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Overflow(_) | Self::OpenFailure(..))
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::AlreadyOpen("x".into()).code(), "EMD-001");
        assert_eq!(Error::KeyNotFound.code(), "EMD-007");
        assert_eq!(
            Error::IndexOutOfRange { index: -4, len: 3 }.code(),
            "EMD-008"
        );
    }

    #[test]
    fn overflow_and_open_failure_are_not_recoverable() {
        assert!(!Error::Overflow("mask".into()).is_recoverable());
        assert!(!Error::OpenFailure("dir".into(), "bad magic".into()).is_recoverable());
        assert!(Error::KeyNotFound.is_recoverable());
    }
}
