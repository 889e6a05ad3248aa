//! # ledgersync sync engine
//!
//! Sync sessions between replicas.
//!
//! This crate provides:
//! - [`SyncSession`], the per-round state machine
//!   (idle → clock exchange → trie negotiation → message exchange → applying)
//! - [`SyncEngine`], a long-lived driver that runs sessions and keeps stats
//! - [`Responder`], the answering side of a session
//! - the [`Transport`] seam, with loopback and mock implementations
//!
//! ## Architecture
//!
//! A round is symmetric in effect but initiated by one side:
//! 1. Exchange clocks so both sides stamp later writes after the peer's
//! 2. Walk the two merkle tries a window at a time to find divergent ranges
//! 3. Fetch the peer's messages and push ours for those ranges
//! 4. Merge the fetched messages, then negotiate again until roots match
//!
//! ## Key Invariants
//!
//! - Nothing local changes before the applying state
//! - Merging is idempotent, so a failed round is retried from scratch
//! - Each network-bound state has its own timeout

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod engine;
mod error;
mod responder;
mod session;
mod transport;

pub use config::SyncConfig;
pub use engine::{SyncEngine, SyncStats};
pub use error::{SyncError, SyncResult};
pub use responder::{Responder, ResponderLimits};
pub use session::{CancelHandle, SessionState, Step, SyncReport, SyncSession};
pub use transport::{EnvelopeHandler, LoopbackTransport, MockTransport, PeerId, Transport, TransportError};
