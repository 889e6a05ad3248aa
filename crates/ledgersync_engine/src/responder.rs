//! Answers sync requests from a replica.

use crate::transport::{EnvelopeHandler, PeerId};
use ledgersync_crdt::Replica;
use ledgersync_protocol::{Envelope, EnvelopeKind, ErrorCode, MessageBatch, ProtocolError, PROTOCOL_VERSION};
use std::sync::Arc;
use tracing::{debug, warn};

/// Bounds on what a single request may ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponderLimits {
    /// Deepest trie window served per prefix. Deeper requests are capped.
    pub max_trie_depth: u8,
    /// Most prefixes accepted in one trie or fetch request.
    pub max_prefixes: usize,
    /// Most messages accepted in one push.
    pub max_push_batch: usize,
}

impl Default for ResponderLimits {
    fn default() -> Self {
        Self {
            max_trie_depth: 8,
            max_prefixes: 256,
            max_push_batch: 5000,
        }
    }
}

/// Serves the responding side of a session.
pub struct Responder {
    replica: Arc<Replica>,
    limits: ResponderLimits,
}

impl Responder {
    /// Creates a responder with default limits.
    pub fn new(replica: Arc<Replica>) -> Self {
        Self::with_limits(replica, ResponderLimits::default())
    }

    /// Creates a responder with explicit limits.
    ///
    /// Trie windows are at least one level deep.
    pub fn with_limits(replica: Arc<Replica>, mut limits: ResponderLimits) -> Self {
        limits.max_trie_depth = limits.max_trie_depth.max(1);
        Self { replica, limits }
    }

    /// The replica being served.
    pub fn replica(&self) -> &Arc<Replica> {
        &self.replica
    }

    /// The request limits.
    pub fn limits(&self) -> ResponderLimits {
        self.limits
    }

    /// Decodes a request, handles it and encodes the reply.
    ///
    /// Never fails: every problem becomes an error envelope.
    pub fn respond(&self, request: &[u8]) -> Vec<u8> {
        let reply = match Envelope::decode(request) {
            Ok(envelope) => self.handle(envelope),
            Err(ProtocolError::VersionMismatch { local, remote }) => {
                warn!(local, remote, "refusing request with unsupported protocol version");
                Envelope::error(
                    ErrorCode::VersionMismatch,
                    format!("supported version {local}, request version {remote}"),
                )
            }
            Err(err) => {
                debug!(error = %err, "malformed request");
                Envelope::error(ErrorCode::BadRequest, err.to_string())
            }
        };
        encode_reply(&reply)
    }

    /// Handles one decoded request.
    pub fn handle(&self, request: Envelope) -> Envelope {
        match request {
            Envelope::ClockRequest { clock } => {
                if let Err(err) = self.replica.check_clock(&clock) {
                    warn!(remote = %clock, error = %err, "peer clock not adopted");
                } else if let Err(err) = self.replica.merge_clock(&clock) {
                    return internal(&err);
                }
                Envelope::ClockResponse {
                    clock: self.replica.latest_clock(),
                }
            }
            Envelope::TrieRequest { depth, prefixes } => {
                if let Some(refusal) = self.check_prefixes(prefixes.len()) {
                    return refusal;
                }
                let depth = depth.clamp(1, self.limits.max_trie_depth);
                let nodes = prefixes
                    .iter()
                    .flat_map(|prefix| self.replica.trie_nodes(prefix, depth))
                    .collect();
                Envelope::TrieResponse { depth, nodes }
            }
            Envelope::FetchRequest { prefixes } => {
                if let Some(refusal) = self.check_prefixes(prefixes.len()) {
                    return refusal;
                }
                let messages = self.replica.messages_in_prefixes(&prefixes);
                debug!(prefixes = prefixes.len(), messages = messages.len(), "serving fetch");
                Envelope::MessageBatch(MessageBatch::from_messages(&messages))
            }
            Envelope::PushRequest(batch) => {
                if batch.len() > self.limits.max_push_batch {
                    return Envelope::error(
                        ErrorCode::LimitExceeded,
                        format!("push of {} messages exceeds {}", batch.len(), self.limits.max_push_batch),
                    );
                }
                let decoded = batch.decode_batch(self.replica.schema());
                for (index, err) in &decoded.errors {
                    warn!(index, error = %err, "dropping malformed pushed message");
                }
                let malformed = decoded.errors.len();
                match self.replica.apply_remote(decoded.messages) {
                    Ok(outcome) => Envelope::PushResponse {
                        applied: saturate(outcome.applied),
                        duplicates: saturate(outcome.duplicates),
                        rejected: saturate(outcome.rejected + malformed),
                    },
                    Err(err) => internal(&err),
                }
            }
            other => Envelope::error(
                ErrorCode::BadRequest,
                format!("{} is not a request", other.kind()),
            ),
        }
    }

    fn check_prefixes(&self, count: usize) -> Option<Envelope> {
        (count > self.limits.max_prefixes).then(|| {
            Envelope::error(
                ErrorCode::LimitExceeded,
                format!("{count} prefixes exceeds {}", self.limits.max_prefixes),
            )
        })
    }
}

impl EnvelopeHandler for Responder {
    fn handle_envelope(&self, _peer: &PeerId, request: &[u8]) -> Vec<u8> {
        self.respond(request)
    }
}

fn internal(err: &dyn std::error::Error) -> Envelope {
    warn!(error = %err, "request failed");
    Envelope::error(ErrorCode::Internal, err.to_string())
}

fn saturate(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Encodes a reply, falling back to a bare internal error envelope.
fn encode_reply(reply: &Envelope) -> Vec<u8> {
    reply.encode().unwrap_or_else(|err| {
        warn!(error = %err, kind = %reply.kind(), "reply does not encode");
        vec![
            PROTOCOL_VERSION,
            EnvelopeKind::Error.as_byte(),
            ErrorCode::Internal.as_byte(),
        ]
    })
}
