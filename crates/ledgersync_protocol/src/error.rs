//! Protocol errors.

use ledgersync_crdt::ClockError;
use thiserror::Error;

/// Result type for envelope codecs.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors decoding or validating an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The envelope was written by an unsupported protocol version.
    #[error("protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch {
        /// Version this side speaks.
        local: u8,
        /// Version found in the envelope.
        remote: u8,
    },

    /// Input ended early.
    #[error("truncated envelope: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        /// Bytes the next field needs.
        needed: usize,
        /// Bytes left.
        remaining: usize,
    },

    /// Bytes left over after the body.
    #[error("{0} trailing bytes after envelope body")]
    TrailingBytes(usize),

    /// Unknown envelope kind byte.
    #[error("unknown envelope kind {0}")]
    UnknownKind(u8),

    /// Unknown error code in an error envelope.
    #[error("unknown error code {0}")]
    UnknownErrorCode(u8),

    /// A trie prefix on the wire is malformed.
    #[error("invalid trie prefix: {0}")]
    InvalidPrefix(String),

    /// A timestamp on the wire is malformed.
    #[error("invalid timestamp: {0}")]
    Timestamp(#[from] ClockError),

    /// Error detail text is not UTF-8.
    #[error("error detail is not valid UTF-8")]
    InvalidUtf8,

    /// A list or message does not fit its length field.
    #[error("{what} too large: {len}")]
    TooLarge {
        /// What overflowed.
        what: &'static str,
        /// Its length.
        len: usize,
    },
}

impl ProtocolError {
    /// Returns true for a version mismatch.
    #[must_use]
    pub fn is_version_mismatch(&self) -> bool {
        matches!(self, Self::VersionMismatch { .. })
    }
}
