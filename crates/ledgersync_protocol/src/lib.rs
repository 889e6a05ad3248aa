//! # ledgersync protocol
//!
//! Byte-level envelopes exchanged during a sync round.
//!
//! This crate provides:
//! - [`Envelope`], one variant per request or response, with a
//!   `[version][kind][body]` framing
//! - the wire forms of trie prefixes and node summaries
//! - [`MessageBatch`], a length-prefixed list of encoded change messages
//!
//! All integers are big-endian. This is a pure codec crate with no I/O.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batch;
mod envelope;
mod error;
pub mod trie;

pub use batch::{DecodedBatch, MessageBatch};
pub use envelope::{Envelope, EnvelopeKind, ErrorCode, PROTOCOL_VERSION};
pub use error::{ProtocolError, ProtocolResult};
