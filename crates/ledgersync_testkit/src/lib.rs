//! # ledgersync testkit
//!
//! Test utilities for ledgersync.
//!
//! This crate provides:
//! - A budget schema and replica fixtures on a manual clock
//! - Property-based test generators using proptest
//! - A harness that runs real sync sessions between replicas and a relay
//! - Crash recovery scenarios for the message log
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ledgersync_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_replica() {
//!     with_temp_replica(|replica| {
//!         replica.write("payees", row_id(1), "name", "grocer").unwrap();
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;
pub mod integration;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
pub use integration::*;
