//! # HealthSync Storage
//!
//! Durable key/value state for HealthSync.
//!
//! This crate provides the lowest-level persistence used by the restore
//! state machine. A key/value state is a flat map of stable string keys to
//! string values. Writes are applied as whole batches: either every key of
//! a batch becomes visible (and durable) or none does.
//!
//! ## Available Backends
//!
//! - [`InMemoryKeyValueState`] - For testing and ephemeral state
//! - [`FileKeyValueState`] - Persistent state file guarded by an advisory lock
//!
//! ## Example
//!
//! ```rust
//! use healthsync_storage::{InMemoryKeyValueState, KeyValueState};
//!
//! let state = InMemoryKeyValueState::new();
//! state.write_batch(&[("phase", "1"), ("deadline", "")]).unwrap();
//! assert_eq!(state.get("phase").unwrap().as_deref(), Some("1"));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::KeyValueState;
pub use error::{StorageError, StorageResult};
pub use file::{atomic_write, sync_directory, FileKeyValueState, STATE_FILE_NAME};
pub use memory::InMemoryKeyValueState;
