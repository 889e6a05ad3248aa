//! Request and response envelopes.
//!
//! Every envelope starts with `[version:u8][kind:u8]`. A receiver that sees a
//! version it does not speak rejects the envelope before looking at the body.

use crate::batch::MessageBatch;
use crate::error::{ProtocolError, ProtocolResult};
use crate::trie::{get_nodes, get_prefixes, get_timestamp, need, put_nodes, put_prefixes, put_timestamp};
use bytes::{Buf, BufMut};
use ledgersync_crdt::{NodeSummary, Prefix, Timestamp};
use std::fmt;

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u8 = 1;

/// Envelope type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EnvelopeKind {
    /// Initiator's clock.
    ClockRequest = 1,
    /// Responder's clock.
    ClockResponse = 2,
    /// Request for trie node windows.
    TrieRequest = 3,
    /// Trie node windows.
    TrieResponse = 4,
    /// Request for the messages under some prefixes.
    FetchRequest = 5,
    /// Messages answering a fetch.
    MessageBatch = 6,
    /// Messages the initiator wants the responder to apply.
    PushRequest = 7,
    /// Counts from applying a push.
    PushResponse = 8,
    /// Request refused.
    Error = 9,
}

impl EnvelopeKind {
    /// Wire byte.
    #[must_use]
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Parses a wire byte.
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            1 => Self::ClockRequest,
            2 => Self::ClockResponse,
            3 => Self::TrieRequest,
            4 => Self::TrieResponse,
            5 => Self::FetchRequest,
            6 => Self::MessageBatch,
            7 => Self::PushRequest,
            8 => Self::PushResponse,
            9 => Self::Error,
            _ => return None,
        })
    }

    /// Returns true for kinds an initiator sends.
    #[must_use]
    pub fn is_request(self) -> bool {
        matches!(
            self,
            Self::ClockRequest | Self::TrieRequest | Self::FetchRequest | Self::PushRequest
        )
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Reason codes carried by [`Envelope::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    /// The request's protocol version is not supported.
    VersionMismatch = 1,
    /// The request could not be parsed or was not a request.
    BadRequest = 2,
    /// The request exceeds a responder limit.
    LimitExceeded = 3,
    /// The responder failed while handling the request.
    Internal = 4,
}

impl ErrorCode {
    /// Wire byte.
    #[must_use]
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Parses a wire byte.
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            1 => Self::VersionMismatch,
            2 => Self::BadRequest,
            3 => Self::LimitExceeded,
            4 => Self::Internal,
            _ => return None,
        })
    }

    /// Stable kebab-case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VersionMismatch => "version-mismatch",
            Self::BadRequest => "bad-request",
            Self::LimitExceeded => "limit-exceeded",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One protocol envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Initiator's clock.
    ClockRequest {
        /// The initiator's latest timestamp.
        clock: Timestamp,
    },
    /// Responder's clock.
    ClockResponse {
        /// The responder's latest timestamp.
        clock: Timestamp,
    },
    /// Asks for every node within `depth` levels below each prefix.
    TrieRequest {
        /// Levels below each prefix.
        depth: u8,
        /// Window roots.
        prefixes: Vec<Prefix>,
    },
    /// Node windows.
    TrieResponse {
        /// Levels actually covered below each requested prefix.
        depth: u8,
        /// Nodes, window roots included.
        nodes: Vec<NodeSummary>,
    },
    /// Asks for the messages stamped under each prefix.
    FetchRequest {
        /// Time ranges.
        prefixes: Vec<Prefix>,
    },
    /// Messages answering a fetch.
    MessageBatch(MessageBatch),
    /// Messages to apply on the responder.
    PushRequest(MessageBatch),
    /// Counts from applying a push.
    PushResponse {
        /// Newly stored.
        applied: u32,
        /// Already present.
        duplicates: u32,
        /// Refused or malformed.
        rejected: u32,
    },
    /// Request refused.
    Error {
        /// Reason code.
        code: ErrorCode,
        /// Human-readable detail.
        detail: String,
    },
}

impl Envelope {
    /// Builds an error envelope.
    pub fn error(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self::Error {
            code,
            detail: detail.into(),
        }
    }

    /// The envelope's kind.
    #[must_use]
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Self::ClockRequest { .. } => EnvelopeKind::ClockRequest,
            Self::ClockResponse { .. } => EnvelopeKind::ClockResponse,
            Self::TrieRequest { .. } => EnvelopeKind::TrieRequest,
            Self::TrieResponse { .. } => EnvelopeKind::TrieResponse,
            Self::FetchRequest { .. } => EnvelopeKind::FetchRequest,
            Self::MessageBatch(_) => EnvelopeKind::MessageBatch,
            Self::PushRequest(_) => EnvelopeKind::PushRequest,
            Self::PushResponse { .. } => EnvelopeKind::PushResponse,
            Self::Error { .. } => EnvelopeKind::Error,
        }
    }

    /// Encodes with the current protocol version.
    ///
    /// # Errors
    ///
    /// A list too long for its length field.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        self.encode_with_version(PROTOCOL_VERSION)
    }

    /// Encodes with an explicit version byte.
    ///
    /// # Errors
    ///
    /// See [`encode`](Self::encode).
    pub fn encode_with_version(&self, version: u8) -> ProtocolResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(64);
        buf.put_u8(version);
        buf.put_u8(self.kind().as_byte());
        match self {
            Self::ClockRequest { clock } | Self::ClockResponse { clock } => {
                put_timestamp(&mut buf, clock);
            }
            Self::TrieRequest { depth, prefixes } => {
                buf.put_u8(*depth);
                put_prefixes(&mut buf, prefixes)?;
            }
            Self::TrieResponse { depth, nodes } => {
                buf.put_u8(*depth);
                put_nodes(&mut buf, nodes)?;
            }
            Self::FetchRequest { prefixes } => put_prefixes(&mut buf, prefixes)?,
            Self::MessageBatch(batch) | Self::PushRequest(batch) => {
                buf.reserve(batch.encoded_len());
                batch.encode_into(&mut buf)?;
            }
            Self::PushResponse {
                applied,
                duplicates,
                rejected,
            } => {
                buf.put_u32(*applied);
                buf.put_u32(*duplicates);
                buf.put_u32(*rejected);
            }
            Self::Error { code, detail } => {
                buf.put_u8(code.as_byte());
                buf.put_slice(detail.as_bytes());
            }
        }
        Ok(buf)
    }

    /// Reads the version and kind without decoding the body.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::VersionMismatch`] for an unsupported version, or a
    /// truncated or unknown header.
    pub fn peek_header(bytes: &[u8]) -> ProtocolResult<(u8, EnvelopeKind)> {
        need(bytes, 2)?;
        let version = bytes[0];
        if version == 0 || version > PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: version,
            });
        }
        let kind = EnvelopeKind::from_byte(bytes[1]).ok_or(ProtocolError::UnknownKind(bytes[1]))?;
        Ok((version, kind))
    }

    /// Decodes an envelope.
    ///
    /// # Errors
    ///
    /// Any header or body problem; a version mismatch is reported before the
    /// body is touched.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let (_, kind) = Self::peek_header(bytes)?;
        let mut buf = &bytes[2..];
        let envelope = match kind {
            EnvelopeKind::ClockRequest => Self::ClockRequest {
                clock: get_timestamp(&mut buf)?,
            },
            EnvelopeKind::ClockResponse => Self::ClockResponse {
                clock: get_timestamp(&mut buf)?,
            },
            EnvelopeKind::TrieRequest => {
                need(buf, 1)?;
                let depth = buf.get_u8();
                Self::TrieRequest {
                    depth,
                    prefixes: get_prefixes(&mut buf)?,
                }
            }
            EnvelopeKind::TrieResponse => {
                need(buf, 1)?;
                let depth = buf.get_u8();
                Self::TrieResponse {
                    depth,
                    nodes: get_nodes(&mut buf)?,
                }
            }
            EnvelopeKind::FetchRequest => Self::FetchRequest {
                prefixes: get_prefixes(&mut buf)?,
            },
            EnvelopeKind::MessageBatch => Self::MessageBatch(MessageBatch::decode_from(&mut buf)?),
            EnvelopeKind::PushRequest => Self::PushRequest(MessageBatch::decode_from(&mut buf)?),
            EnvelopeKind::PushResponse => {
                need(buf, 12)?;
                Self::PushResponse {
                    applied: buf.get_u32(),
                    duplicates: buf.get_u32(),
                    rejected: buf.get_u32(),
                }
            }
            EnvelopeKind::Error => {
                need(buf, 1)?;
                let code_byte = buf.get_u8();
                let code = ErrorCode::from_byte(code_byte)
                    .ok_or(ProtocolError::UnknownErrorCode(code_byte))?;
                let detail = std::str::from_utf8(buf)
                    .map_err(|_| ProtocolError::InvalidUtf8)?
                    .to_owned();
                buf = &[];
                Self::Error { code, detail }
            }
        };
        if !buf.is_empty() {
            return Err(ProtocolError::TrailingBytes(buf.len()));
        }
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgersync_crdt::{ReplicaId, TrieHash};
    use proptest::prelude::*;

    fn clock() -> Timestamp {
        Timestamp::new(1_700_000_000_000, 3, ReplicaId::from_bytes([4; 16]))
    }

    #[test]
    fn header_layout() {
        let bytes = Envelope::ClockRequest { clock: clock() }.encode().unwrap();
        assert_eq!(bytes[0], PROTOCOL_VERSION);
        assert_eq!(bytes[1], EnvelopeKind::ClockRequest.as_byte());
        assert_eq!(bytes.len(), 2 + 26);
        assert_eq!(
            Envelope::peek_header(&bytes).unwrap(),
            (1, EnvelopeKind::ClockRequest)
        );
    }

    #[test]
    fn every_kind_decodes_to_itself() {
        let prefix = Prefix::from_digits(&[1, 2]).unwrap();
        let envelopes = vec![
            Envelope::ClockRequest { clock: clock() },
            Envelope::ClockResponse { clock: clock() },
            Envelope::TrieRequest {
                depth: 4,
                prefixes: vec![Prefix::ROOT, prefix],
            },
            Envelope::TrieResponse {
                depth: 4,
                nodes: vec![NodeSummary {
                    prefix,
                    hash: TrieHash::from_bytes([9; 32]),
                    count: 12,
                }],
            },
            Envelope::FetchRequest {
                prefixes: vec![prefix],
            },
            Envelope::MessageBatch(MessageBatch::new()),
            Envelope::PushRequest(MessageBatch::new()),
            Envelope::PushResponse {
                applied: 3,
                duplicates: 2,
                rejected: 1,
            },
            Envelope::error(ErrorCode::LimitExceeded, "too many prefixes"),
        ];
        for envelope in envelopes {
            let bytes = envelope.encode().unwrap();
            assert_eq!(Envelope::decode(&bytes).unwrap(), envelope, "{}", envelope.kind());
        }
    }

    #[test]
    fn newer_version_is_refused_before_the_body() {
        let mut bytes = Envelope::ClockRequest { clock: clock() }
            .encode_with_version(2)
            .unwrap();
        bytes.truncate(3);
        assert_eq!(
            Envelope::decode(&bytes),
            Err(ProtocolError::VersionMismatch {
                local: 1,
                remote: 2
            })
        );
    }

    #[test]
    fn malformed_input_is_an_error() {
        assert!(matches!(
            Envelope::decode(&[1]),
            Err(ProtocolError::Truncated { .. })
        ));
        assert_eq!(Envelope::decode(&[1, 42]), Err(ProtocolError::UnknownKind(42)));
        assert_eq!(
            Envelope::decode(&[1, 9, 77]),
            Err(ProtocolError::UnknownErrorCode(77))
        );
        let mut bytes = Envelope::PushResponse {
            applied: 0,
            duplicates: 0,
            rejected: 0,
        }
        .encode()
        .unwrap();
        bytes.push(0);
        assert_eq!(Envelope::decode(&bytes), Err(ProtocolError::TrailingBytes(1)));
    }

    #[test]
    fn kind_classification() {
        assert!(EnvelopeKind::FetchRequest.is_request());
        assert!(!EnvelopeKind::MessageBatch.is_request());
        for byte in 1..=9 {
            assert_eq!(EnvelopeKind::from_byte(byte).map(EnvelopeKind::as_byte), Some(byte));
        }
        assert_eq!(ErrorCode::VersionMismatch.to_string(), "version-mismatch");
    }

    proptest! {
        #[test]
        fn decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
            let _ = Envelope::decode(&bytes);
        }
    }
}
