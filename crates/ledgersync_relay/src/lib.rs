//! # ledgersync relay
//!
//! A message relay for ledgersync.
//!
//! This crate provides:
//! - [`RelayServer`], a replica that stores and serves change messages but
//!   never writes cells of its own
//! - request limits from [`RelayConfig`]
//! - per-peer request counters
//! - an in-process [`RelayHandle`] that implements the engine's transport,
//!   backed by a tokio task
//!
//! Peers that never talk to each other directly converge by syncing with the
//! same relay: the relay holds the union of every message pushed to it.

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod server;

pub use config::RelayConfig;
pub use error::{RelayError, RelayResult};
pub use server::{PeerStats, RelayHandle, RelayServer};
