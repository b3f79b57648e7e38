//! Property-based test generators using proptest.

use healthsync_core::{Record, RecordId, RecordType};
use proptest::prelude::*;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Strategy for record types.
pub fn record_type_strategy() -> impl Strategy<Value = RecordType> {
    prop::sample::select(RecordType::backup_order().to_vec())
}

/// Strategy for package names.
pub fn package_name_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec![
        "com.example.fitness",
        "com.example.scale",
        "com.example.sleep",
    ])
    .prop_map(str::to_string)
}

/// Strategy for opaque record payloads.
pub fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..64)
}

/// Strategy for records with random ids.
pub fn record_strategy() -> impl Strategy<Value = Record> {
    (
        prop::array::uniform16(any::<u8>()),
        record_type_strategy(),
        package_name_strategy(),
        0i64..1_000_000,
        payload_strategy(),
    )
        .prop_map(|(id, record_type, package, time, payload)| {
            Record::new(record_type, package, time)
                .with_id(RecordId(Uuid::from_bytes(id)))
                .with_payload(payload)
        })
}

/// Strategy for how many rows each table holds.
pub fn table_sizes_strategy(
    max_per_table: usize,
) -> impl Strategy<Value = BTreeMap<RecordType, usize>> {
    prop::collection::btree_map(record_type_strategy(), 0..=max_per_table, 0..=8)
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn records_have_known_packages(record in record_strategy()) {
            prop_assert!(record.package_name.starts_with("com.example."));
        }

        #[test]
        fn table_sizes_are_bounded(sizes in table_sizes_strategy(5)) {
            prop_assert!(sizes.values().all(|n| *n <= 5));
        }
    }
}
