//! Error types for the replica core.

use crate::clock::ClockError;
use crate::message::MessageError;
use crate::schema::SchemaError;
use thiserror::Error;

/// Result type for replica operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by a replica and its message log.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] ledgersync_storage::StorageError),

    /// The logical clock refused to advance.
    #[error("clock error: {0}")]
    Clock(#[from] ClockError),

    /// A message could not be decoded.
    #[error("message error: {0}")]
    Message(#[from] MessageError),

    /// A dataset or column name is not declared.
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// The message log is damaged before its tail.
    #[error("log corruption at offset {offset}: {message}")]
    LogCorruption {
        /// Byte offset of the bad record.
        offset: u64,
        /// Description of the damage.
        message: String,
    },

    /// A value is not storable.
    #[error("invalid value: {message}")]
    InvalidValue {
        /// Why it was refused.
        message: String,
    },

    /// A merge was started while another one was running.
    #[error("a merge is already in progress")]
    MergeInProgress,
}

impl CoreError {
    /// Creates a log corruption error.
    pub fn log_corruption(offset: u64, message: impl Into<String>) -> Self {
        Self::LogCorruption {
            offset,
            message: message.into(),
        }
    }

    /// Creates an invalid value error.
    pub fn invalid_value(message: impl Into<String>) -> Self {
        Self::InvalidValue {
            message: message.into(),
        }
    }

    /// Returns true if the error came from the clock.
    #[must_use]
    pub fn is_clock(&self) -> bool {
        matches!(self, Self::Clock(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_cause() {
        let err = CoreError::log_corruption(42, "checksum mismatch");
        assert_eq!(err.to_string(), "log corruption at offset 42: checksum mismatch");
        let err: CoreError = ClockError::CounterOverflow { millis: 1 }.into();
        assert!(err.is_clock());
        assert!(!CoreError::invalid_value("NaN").is_clock());
    }
}
