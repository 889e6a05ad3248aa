//! Error types for sync sessions.

use crate::transport::TransportError;
use ledgersync_crdt::CoreError;
use ledgersync_protocol::{ErrorCode, ProtocolError};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that end a sync session.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The transport failed to deliver a request or its response.
    #[error("network error: {message}")]
    Network {
        /// Error message.
        message: String,
        /// Whether the session can be retried.
        retryable: bool,
    },

    /// The peer speaks a protocol version this side does not.
    #[error("protocol version mismatch: {message}")]
    VersionMismatch {
        /// Detail from the decoder or the peer.
        message: String,
    },

    /// A round trip took longer than its state allows.
    #[error("timed out during {state}")]
    Timeout {
        /// State the session was in.
        state: &'static str,
    },

    /// The session was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Root hashes still differ after the last allowed pass.
    #[error("replicas still differ after {passes} passes")]
    OutOfSync {
        /// Passes run.
        passes: u32,
    },

    /// The peer sent something the session did not expect.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer refused a request.
    #[error("peer refused request ({code}): {detail}")]
    Remote {
        /// Reason code.
        code: ErrorCode,
        /// Peer's detail text.
        detail: String,
    },

    /// Local replica error.
    #[error("replica error: {0}")]
    Core(#[from] CoreError),

    /// Operation not valid in the current state.
    #[error("cannot {action} while {state}")]
    InvalidState {
        /// Current state.
        state: &'static str,
        /// Attempted operation.
        action: &'static str,
    },
}

impl SyncError {
    /// Creates a retryable network error.
    pub fn network_retryable(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable network error.
    pub fn network_fatal(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Stable kebab-case reason for reporting.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network-failure",
            Self::VersionMismatch { .. } => "version-mismatch",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::OutOfSync { .. } => "out-of-sync",
            Self::Protocol(_) => "protocol-error",
            Self::Remote { .. } => "remote-error",
            Self::Core(_) => "replica-error",
            Self::InvalidState { .. } => "invalid-state",
        }
    }

    /// Detail string to show next to [`reason`](Self::reason).
    #[must_use]
    pub fn meta(&self) -> String {
        match self {
            Self::Network { message, .. } | Self::VersionMismatch { message } => message.clone(),
            Self::Timeout { state } => (*state).to_string(),
            Self::Cancelled => String::new(),
            Self::OutOfSync { passes } => format!("passes={passes}"),
            Self::Protocol(message) => message.clone(),
            Self::Remote { code, detail } => format!("{code}: {detail}"),
            Self::Core(err) => err.to_string(),
            Self::InvalidState { state, action } => format!("{action} in {state}"),
        }
    }

    /// Returns true if running the session again may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { retryable, .. } => *retryable,
            Self::Timeout { .. } => true,
            Self::OutOfSync { .. } => true,
            Self::Remote { code, .. } => *code == ErrorCode::Internal,
            _ => false,
        }
    }
}

impl From<TransportError> for SyncError {
    fn from(err: TransportError) -> Self {
        Self::Network {
            retryable: err.is_retryable(),
            message: err.to_string(),
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        if err.is_version_mismatch() {
            Self::VersionMismatch {
                message: err.to_string(),
            }
        } else {
            Self::Protocol(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::network_retryable("connection reset").is_retryable());
        assert!(!SyncError::network_fatal("peer unknown").is_retryable());
        assert!(SyncError::Timeout { state: "clock-exchange" }.is_retryable());
        assert!(SyncError::OutOfSync { passes: 10 }.is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::VersionMismatch {
            message: "remote 2".into()
        }
        .is_retryable());
    }

    #[test]
    fn reasons_are_stable() {
        assert_eq!(SyncError::network_retryable("x").reason(), "network-failure");
        assert_eq!(
            SyncError::VersionMismatch { message: "x".into() }.reason(),
            "version-mismatch"
        );
        assert_eq!(SyncError::Timeout { state: "x" }.reason(), "timeout");
        assert_eq!(SyncError::OutOfSync { passes: 2 }.reason(), "out-of-sync");
        assert_eq!(SyncError::OutOfSync { passes: 2 }.meta(), "passes=2");
    }

    #[test]
    fn protocol_version_mismatch_maps_through() {
        let err: SyncError = ProtocolError::VersionMismatch { local: 1, remote: 2 }.into();
        assert!(matches!(err, SyncError::VersionMismatch { .. }));
        assert!(err.to_string().contains('2'));

        let err: SyncError = ProtocolError::UnknownKind(42).into();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[test]
    fn remote_error_display() {
        let err = SyncError::Remote {
            code: ErrorCode::LimitExceeded,
            detail: "too many prefixes".into(),
        };
        assert_eq!(err.to_string(), "peer refused request (limit-exceeded): too many prefixes");
        assert!(!err.is_retryable());
    }
}
