//! Error types for the relay.

use ledgersync_crdt::CoreError;
use thiserror::Error;

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

/// Errors that can occur in the relay.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Configuration rejected.
    #[error("invalid relay configuration: {0}")]
    InvalidConfig(String),

    /// The relay's replica failed.
    #[error("replica error: {0}")]
    Core(#[from] CoreError),

    /// The relay task has stopped.
    #[error("relay stopped")]
    Stopped,
}

impl RelayError {
    /// Returns true if the caller caused the error.
    pub fn is_client_error(&self) -> bool {
        matches!(self, RelayError::InvalidConfig(_))
    }

    /// Returns true if the relay itself failed.
    pub fn is_server_error(&self) -> bool {
        matches!(self, RelayError::Core(_) | RelayError::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(RelayError::InvalidConfig("x".into()).is_client_error());
        assert!(!RelayError::InvalidConfig("x".into()).is_server_error());
        assert!(RelayError::Stopped.is_server_error());
        assert_eq!(RelayError::Stopped.to_string(), "relay stopped");
    }
}
