//! # ledgersync crdt
//!
//! The convergence core of ledgersync: everything a replica needs to accept
//! local writes and remote messages and end up with the same cell values as
//! every other replica that saw the same messages.
//!
//! ## Pieces
//!
//! - [`LogicalClock`] issues [`Timestamp`]s: wall-clock milliseconds, a
//!   16-bit counter and the replica id. Timestamps totally order all changes.
//! - [`ChangeMessage`] records a single cell write and has one canonical
//!   byte encoding.
//! - [`MessageStore`] keeps every message and resolves each cell to its
//!   greatest-timestamp write (last writer wins).
//! - [`MerkleTrie`] summarizes the message set by time bucket so two replicas
//!   can find where they differ without listing messages.
//! - [`MergeEngine`] applies remote batches; [`Replica`] ties it all together
//!   behind one lock with an optional durable [`MessageLog`].
//!
//! ## Example
//!
//! ```rust
//! use ledgersync_crdt::{DatasetDef, Replica, ReplicaId, RowId, Schema, Value};
//! use std::sync::Arc;
//!
//! let schema = Arc::new(
//!     Schema::new(vec![DatasetDef::new(1, "transactions").column(1, "amount")]).unwrap(),
//! );
//! let a = Replica::new(ReplicaId::random(), schema.clone());
//! let b = Replica::new(ReplicaId::random(), schema);
//!
//! let row = RowId::random();
//! let message = a.write("transactions", row, "amount", 500).unwrap();
//! b.apply_remote(vec![message]).unwrap();
//!
//! assert_eq!(a.root_hash(), b.root_hash());
//! assert_eq!(
//!     b.current_value("transactions", row, "amount").unwrap(),
//!     Some(Value::from(500))
//! );
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod clock;
mod error;
mod ids;
pub mod log;
mod merge;
pub mod merkle;
pub mod message;
mod replica;
mod schema;
mod store;
mod value;

pub use clock::{
    ClockError, ClockResult, LogicalClock, ManualTimeSource, SystemTimeSource, TimeSource,
    Timestamp, DEFAULT_MAX_DRIFT, MAX_MILLIS, TIMESTAMP_LEN,
};
pub use error::{CoreError, CoreResult};
pub use ids::{CellKey, ColumnId, DatasetId, ReplicaId, RowId};
pub use log::{scan_bytes, LogRecord, LogScan, MessageLog};
pub use merge::{latest_timestamp, ApplyOutcome, CellChange, MergeContext, MergeEngine, MergeState};
pub use merkle::{
    DiffStep, Direction, Divergence, MerkleTrie, NodeSummary, Prefix, TrieHash, TrieView,
    KEY_DEPTH,
};
pub use message::{ChangeMessage, MessageError, MessageResult};
pub use replica::{CellSink, Replica, ReplicaConfig, ReplicaStats};
pub use schema::{ColumnDef, DatasetDef, Schema, SchemaError};
pub use store::{AppendOutcome, MessageStore, StoreEntry};
pub use value::Value;
