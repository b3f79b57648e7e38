//! # HealthSync Core
//!
//! Record store model and shared runtime seams for HealthSync.
//!
//! This crate provides:
//! - Domain types: record types, stable record ids, page tokens
//! - The [`RecordStore`] trait and its transactional write API
//! - [`MemoryRecordStore`], an in-memory store with change log and snapshot files
//! - The grant-time blob and its store
//! - The deferred [`JobScheduler`] seam
//! - The [`TaskExecutor`] seam with inline and manual executors
//!
//! ## Example
//!
//! ```rust
//! use healthsync_core::{MemoryRecordStore, Record, RecordStore, RecordStoreExt, RecordType};
//!
//! let store = MemoryRecordStore::new();
//! store
//!     .write(|txn| txn.upsert_record(Record::new(RecordType::Steps, "com.example.fit", 1_000)))
//!     .unwrap();
//!
//! assert_eq!(store.record_count(RecordType::Steps).unwrap(), 1);
//! assert_eq!(store.latest_change_log_row_id().unwrap(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod codec;
mod config;
mod error;
mod executor;
mod grant_time;
mod memory;
mod record;
mod scheduler;
mod store;
mod types;

pub use clock::{duration_millis, Clock, ManualClock, SystemClock};
pub use codec::{from_cbor, to_cbor};
pub use config::{StoreConfig, CURRENT_SCHEMA_VERSION};
pub use error::{CoreError, CoreResult};
pub use executor::{InlineExecutor, ManualExecutor, Task, TaskExecutor};
pub use grant_time::{GrantTimeState, GrantTimeStore, MemoryGrantTimeStore};
pub use memory::MemoryRecordStore;
pub use record::{
    AppInfo, ChangeLogEntry, ChangeOperation, MedicalDataSource, MedicalResource, Record,
    ResourceKey,
};
pub use scheduler::{JobHandler, JobRequest, JobScheduler, ManualJobScheduler};
pub use store::{RecordPage, RecordStore, RecordStoreExt, StoreTransaction};
pub use types::{HealthDataCategory, PageToken, RecordId, RecordType};
