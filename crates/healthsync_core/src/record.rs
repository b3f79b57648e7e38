//! Rows held by a record store.

use crate::types::{RecordId, RecordType};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use uuid::Uuid;

/// A single health record.
///
/// The typed fields of a record are owned by the payload codec; the store
/// only sees the opaque `payload` plus the columns it needs for ordering,
/// ownership and cross-type references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Stable external id.
    pub id: RecordId,
    /// Table this record lives in.
    pub record_type: RecordType,
    /// Package name of the app that wrote the record.
    pub package_name: String,
    /// Start time, epoch milliseconds.
    pub time_millis: i64,
    /// For exercise sessions: the planned session this one completes.
    pub planned_exercise_session_id: Option<RecordId>,
    /// For planned sessions: the exercise session that completed it.
    pub completed_exercise_session_id: Option<RecordId>,
    /// Serialized record fields.
    pub payload: Vec<u8>,
}

impl Record {
    /// Creates a record with a fresh id and an empty payload.
    pub fn new(record_type: RecordType, package_name: impl Into<String>, time_millis: i64) -> Self {
        Self {
            id: RecordId::new(),
            record_type,
            package_name: package_name.into(),
            time_millis,
            planned_exercise_session_id: None,
            completed_exercise_session_id: None,
            payload: Vec::new(),
        }
    }

    /// Sets the id.
    #[must_use]
    pub fn with_id(mut self, id: RecordId) -> Self {
        self.id = id;
        self
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Links an exercise session to the planned session it completes.
    #[must_use]
    pub fn with_planned_session(mut self, planned: RecordId) -> Self {
        self.planned_exercise_session_id = Some(planned);
        self
    }

    /// Links a planned session to the exercise session that completed it.
    #[must_use]
    pub fn with_completed_session(mut self, completed: RecordId) -> Self {
        self.completed_exercise_session_id = Some(completed);
        self
    }
}

/// Metadata about an app that owns records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    /// Unique package name.
    pub package_name: String,
    /// Human readable name, absent for placeholders.
    pub app_name: Option<String>,
    /// Record types this app has written.
    pub record_types_used: BTreeSet<RecordType>,
}

impl AppInfo {
    /// Creates app info with a display name.
    pub fn new(package_name: impl Into<String>, app_name: impl Into<String>) -> Self {
        Self {
            package_name: package_name.into(),
            app_name: Some(app_name.into()),
            record_types_used: BTreeSet::new(),
        }
    }

    /// Creates a placeholder entry for an app known only by package name.
    pub fn placeholder(package_name: impl Into<String>) -> Self {
        Self {
            package_name: package_name.into(),
            app_name: None,
            record_types_used: BTreeSet::new(),
        }
    }
}

/// A personal-health-record data source.
///
/// Unique on (`package_name`, `display_name`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MedicalDataSource {
    /// Row identity.
    pub id: Uuid,
    /// Owning app.
    pub package_name: String,
    /// Name shown to the user.
    pub display_name: String,
    /// FHIR server base URI.
    pub fhir_base_uri: String,
}

impl MedicalDataSource {
    /// Creates a data source with a fresh id.
    pub fn new(
        package_name: impl Into<String>,
        display_name: impl Into<String>,
        fhir_base_uri: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            package_name: package_name.into(),
            display_name: display_name.into(),
            fhir_base_uri: fhir_base_uri.into(),
        }
    }

    /// Returns the unique key of this data source.
    #[must_use]
    pub fn unique_key(&self) -> (String, String) {
        (self.package_name.clone(), self.display_name.clone())
    }
}

/// Content-derived identity of a medical resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey(pub [u8; 32]);

/// A personal-health-record resource stored under a data source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MedicalResource {
    /// Data source this resource belongs to.
    pub data_source_id: Uuid,
    /// Medical resource type code.
    pub resource_type: u16,
    /// FHIR resource type, e.g. `Immunization`.
    pub fhir_resource_type: String,
    /// FHIR resource id, the natural key within the source.
    pub fhir_resource_id: String,
    /// Raw FHIR JSON.
    pub payload: Vec<u8>,
}

impl MedicalResource {
    /// Returns the unique key: SHA-256 over source, type and natural key.
    #[must_use]
    pub fn key(&self) -> ResourceKey {
        let mut hasher = Sha256::new();
        hasher.update(self.data_source_id.as_bytes());
        hasher.update(self.resource_type.to_be_bytes());
        hasher.update((self.fhir_resource_type.len() as u64).to_be_bytes());
        hasher.update(self.fhir_resource_type.as_bytes());
        hasher.update(self.fhir_resource_id.as_bytes());
        ResourceKey(hasher.finalize().into())
    }
}

/// Kind of change recorded in the change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeOperation {
    /// Record inserted or replaced.
    Upsert,
    /// Record deleted.
    Delete,
}

/// One row of the change log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    /// Monotonic row id, starting at 1.
    pub row_id: u64,
    /// Table of the changed record.
    pub record_type: RecordType,
    /// Changed record.
    pub record_id: RecordId,
    /// What happened.
    pub operation: ChangeOperation,
}
