//! # HealthSync Restore
//!
//! Device-to-device restore for HealthSync.
//!
//! This crate provides:
//! - The restore state machine (download → stage → merge)
//! - Timeout and retry jobs derived from persisted state
//! - The staging area for downloaded backup files
//! - The merge engine that folds a staged database into the live store
//! - The process-wide sync gate
//! - A tokio-backed job scheduler and task executor
//!
//! ## Lifecycle
//!
//! ```text
//! Unknown → WaitingForStaging → StagingInProgress → StagingDone
//!         → MergingInProgress → MergingDone
//! ```
//!
//! ## Key Invariants
//!
//! - Persisted state is the only truth; jobs are re-derived from it
//! - Merge is additive and idempotent
//! - A staged database with another schema version is never merged
//! - Merge errors end the restore with an error code instead of escaping

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod gate;
mod jobs;
mod machine;
mod merge;
mod staging;
mod state;

pub use config::{MergeConfig, RestoreConfig};
pub use error::{RestoreError, RestoreResult};
pub use gate::DataSyncGate;
pub use jobs::{JobKind, TokioExecutor, TokioJobScheduler, JOB_NAMESPACE};
pub use machine::{MergeOutcome, RestoreServices, RestoreStateMachine, StagingReport};
pub use merge::{check_versions, MergeEngine, MergeInput, MergeStats};
pub use staging::{backup_file_names, StagingArea, GRANT_TIME_FILE_NAME, STAGED_DATABASE_NAME};
pub use state::{
    DataDownloadState, DataRestoreError, DataRestoreState, InternalRestoreState,
    PersistedRestoreState, PhaseRecord, DATA_DOWNLOAD_STATE_KEY, DATA_RESTORE_ERROR_KEY,
    DATA_RESTORE_STATE_KEY,
};
