//! Core type definitions for HealthSync.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The kind of health record stored in a record table.
///
/// Each type lives in its own table. Some types reference others by id
/// (an exercise session may point at the planned session it completes), so
/// every walk over the tables uses [`RecordType::backup_order`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RecordType {
    /// Step counts.
    Steps,
    /// Heart rate samples.
    HeartRate,
    /// Blood pressure readings.
    BloodPressure,
    /// Body weight.
    Weight,
    /// Sleep sessions.
    SleepSession,
    /// Nutrition entries.
    Nutrition,
    /// Completed exercise sessions, may reference a planned session.
    ExerciseSession,
    /// Planned exercise sessions, referenced by exercise sessions.
    PlannedExerciseSession,
}

/// Referenced types come before the types that reference them.
const BACKUP_ORDER: [RecordType; 8] = [
    RecordType::PlannedExerciseSession,
    RecordType::ExerciseSession,
    RecordType::Steps,
    RecordType::HeartRate,
    RecordType::BloodPressure,
    RecordType::Weight,
    RecordType::SleepSession,
    RecordType::Nutrition,
];

impl RecordType {
    /// Returns every record type in the fixed global backup order.
    #[must_use]
    pub fn backup_order() -> &'static [RecordType] {
        &BACKUP_ORDER
    }

    /// Returns the position of this type in [`RecordType::backup_order`].
    #[must_use]
    pub fn backup_rank(self) -> usize {
        BACKUP_ORDER
            .iter()
            .position(|t| *t == self)
            .unwrap_or(BACKUP_ORDER.len())
    }

    /// Returns the type that follows this one in backup order.
    #[must_use]
    pub fn next_in_backup_order(self) -> Option<RecordType> {
        BACKUP_ORDER.get(self.backup_rank() + 1).copied()
    }

    /// Returns the stable numeric code of this type.
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            RecordType::Steps => 1,
            RecordType::HeartRate => 2,
            RecordType::BloodPressure => 3,
            RecordType::Weight => 4,
            RecordType::SleepSession => 5,
            RecordType::Nutrition => 6,
            RecordType::ExerciseSession => 7,
            RecordType::PlannedExerciseSession => 8,
        }
    }

    /// Parses a stable numeric code.
    #[must_use]
    pub fn from_code(code: u16) -> Option<Self> {
        BACKUP_ORDER.iter().copied().find(|t| t.code() == code)
    }

    /// Returns the health data category this type belongs to.
    #[must_use]
    pub const fn category(self) -> HealthDataCategory {
        match self {
            RecordType::Steps
            | RecordType::ExerciseSession
            | RecordType::PlannedExerciseSession => HealthDataCategory::Activity,
            RecordType::HeartRate | RecordType::BloodPressure => HealthDataCategory::Vitals,
            RecordType::Weight => HealthDataCategory::BodyMeasurements,
            RecordType::SleepSession => HealthDataCategory::Sleep,
            RecordType::Nutrition => HealthDataCategory::Nutrition,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Grouping of record types used for per-category app priority lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HealthDataCategory {
    /// Movement and exercise.
    Activity,
    /// Body measurements.
    BodyMeasurements,
    /// Nutrition and hydration.
    Nutrition,
    /// Sleep.
    Sleep,
    /// Vital signs.
    Vitals,
}

/// Stable external identifier of a record.
///
/// The same id identifies a record on every device, which is what makes
/// restore and merge idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub Uuid);

impl RecordId {
    /// Creates a new random record id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parses the hyphenated string form.
    ///
    /// # Errors
    ///
    /// Returns an error if `s` is not a valid UUID.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cursor into one record table.
///
/// Holds the row id of the last row returned. [`PageToken::EMPTY`] means
/// "start of the table" when passed in and "table exhausted" when returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageToken(pub i64);

impl PageToken {
    /// The start-of-table / end-of-table sentinel.
    pub const EMPTY: PageToken = PageToken(-1);

    /// Creates a token positioned after `row_id`.
    #[must_use]
    pub fn after_row(row_id: u64) -> Self {
        Self(i64::try_from(row_id).unwrap_or(i64::MAX))
    }

    /// Returns true for the sentinel.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 < 0
    }

    /// Returns the row id after which reading resumes (0 for the sentinel).
    #[must_use]
    pub fn resume_after(self) -> u64 {
        u64::try_from(self.0).unwrap_or(0)
    }
}

impl Default for PageToken {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Display for PageToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planned_sessions_come_first() {
        let order = RecordType::backup_order();
        assert_eq!(order[0], RecordType::PlannedExerciseSession);
        assert!(
            RecordType::PlannedExerciseSession.backup_rank()
                < RecordType::ExerciseSession.backup_rank()
        );
        assert_eq!(order.len(), 8);
    }

    #[test]
    fn next_in_backup_order_walks_every_type() {
        let mut seen = vec![RecordType::backup_order()[0]];
        while let Some(next) = seen.last().and_then(|t| t.next_in_backup_order()) {
            seen.push(next);
        }
        assert_eq!(seen, RecordType::backup_order());
    }

    #[test]
    fn codes_round_trip() {
        for t in RecordType::backup_order() {
            assert_eq!(RecordType::from_code(t.code()), Some(*t));
        }
        assert_eq!(RecordType::from_code(0), None);
    }

    #[test]
    fn page_token_sentinel() {
        assert!(PageToken::EMPTY.is_empty());
        assert_eq!(PageToken::EMPTY.resume_after(), 0);
        assert_eq!(PageToken::after_row(42).resume_after(), 42);
        assert!(!PageToken::after_row(42).is_empty());
    }

    #[test]
    fn record_id_display_parses_back() {
        let id = RecordId::new();
        assert_eq!(RecordId::parse(&id.to_string()).unwrap(), id);
    }
}
