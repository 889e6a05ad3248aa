//! # ledgersync storage
//!
//! Byte-level persistence for a replica's message log.
//!
//! A backend is an append-only byte sink with random reads. It knows nothing
//! about message records, checksums or clocks; the log layer in
//! `ledgersync_crdt` owns the record format and recovery rules.
//!
//! ## Backends
//!
//! - [`InMemoryBackend`] keeps bytes in a shared buffer. Clones share the
//!   same buffer, which lets tests "restart" a replica on the same log.
//! - [`FileBackend`] writes to a single file through OS file APIs.
//!
//! ## Example
//!
//! ```rust
//! use ledgersync_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut log = InMemoryBackend::new();
//! let first = log.append(b"record-1").unwrap();
//! let second = log.append(b"record-2").unwrap();
//! assert_eq!(second, first + 8);
//! assert_eq!(log.read_all().unwrap(), b"record-1record-2");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
