//! # HealthSync Cloud
//!
//! Cloud backup and restore for HealthSync.
//!
//! This crate provides:
//! - A paginated walker over every record table plus the change log
//! - Persisted, opaque continuation tokens
//! - Transactional application of restored changes
//! - Settings backup and restore
//!
//! ## Protocol
//!
//! A backup begins with a full walk over the record tables in backup order.
//! When every table is exhausted the returned token switches to the change
//! log, and later calls return incremental changes. If the change log was
//! purged past a token's position the caller receives an empty token and
//! must start a full backup again.
//!
//! ## Key Invariants
//!
//! - Referenced record types are emitted before the types referencing them
//! - Tokens are immutable; a new one is written for every response
//! - A restore batch commits completely or not at all

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod applier;
mod config;
mod error;
mod manager;
mod messages;
mod token;
mod walker;

pub use applier::{CloudRestoreApplier, RestoreStats};
pub use config::{CloudConfig, BACKUP_DATA_VERSION};
pub use error::{CloudError, CloudResult};
pub use manager::CloudBackupManager;
pub use messages::{
    AppMetadata, BackupChange, BackupSettings, GetChangesForBackupResponse, RestoreChange,
};
pub use token::BackupChangeToken;
pub use walker::{BackupPage, CloudBackupWalker};
