//! # HealthSync Testkit
//!
//! Test utilities for HealthSync.
//!
//! This crate provides:
//! - Record, app and medical-record fixtures
//! - Store population and snapshot helpers
//! - A record store with injectable transaction failures
//! - Property-based test generators using proptest
//! - Tracing setup for tests
//!
//! ## Usage
//!
//! ```rust
//! use healthsync_core::{RecordStore, RecordType};
//! use healthsync_testkit::prelude::*;
//!
//! init_tracing();
//! let store = memory_store();
//! populate(&store, RecordType::Steps, 3);
//! assert_eq!(store.record_count(RecordType::Steps).unwrap(), 3);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod faults;
pub mod fixtures;
pub mod generators;
pub mod logging;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::faults::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::logging::*;
}

pub use faults::*;
pub use fixtures::*;
pub use generators::*;
pub use logging::*;
