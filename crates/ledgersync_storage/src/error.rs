//! Storage error types.

use std::io;
use thiserror::Error;

/// Result alias for backend operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Failures reported by a [`crate::StorageBackend`].
#[derive(Debug, Error)]
pub enum StorageError {
    /// The operating system rejected an I/O call.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A read touched bytes past the end of the log.
    #[error("read out of bounds: offset {offset} + {len} bytes exceeds size {size}")]
    OutOfBounds {
        /// Start of the requested range.
        offset: u64,
        /// Number of bytes requested.
        len: usize,
        /// Size of the log when the read was attempted.
        size: u64,
    },

    /// Truncation can only shrink the log.
    #[error("cannot truncate log of {size} bytes to {requested} bytes")]
    InvalidTruncate {
        /// Requested length.
        requested: u64,
        /// Current length.
        size: u64,
    },

    /// The log file does not exist and creation was not requested.
    #[error("log not found: {0}")]
    NotFound(String),
}

impl StorageError {
    /// Returns true when the error came from a short or misplaced read rather
    /// than from the operating system.
    pub fn is_bounds(&self) -> bool {
        matches!(self, StorageError::OutOfBounds { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_mentions_range() {
        let err = StorageError::OutOfBounds {
            offset: 40,
            len: 12,
            size: 48,
        };
        let text = err.to_string();
        assert!(text.contains("40"));
        assert!(text.contains("48"));
        assert!(err.is_bounds());
    }

    #[test]
    fn io_errors_convert() {
        let err: StorageError = io::Error::other("disk gone").into();
        assert!(!err.is_bounds());
        assert!(err.to_string().contains("disk gone"));
    }
}
