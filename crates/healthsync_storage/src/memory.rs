//! In-memory key/value state for testing.

use crate::backend::KeyValueState;
use crate::error::StorageResult;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// An in-memory key/value state.
///
/// This implementation keeps everything in memory and is suitable for:
/// - Unit tests
/// - Simulating process restarts (share one instance between two state
///   machines)
///
/// # Example
///
/// ```rust
/// use healthsync_storage::{InMemoryKeyValueState, KeyValueState};
///
/// let state = InMemoryKeyValueState::new();
/// state.set("key", "value").unwrap();
/// assert_eq!(state.batches_written(), 1);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryKeyValueState {
    entries: RwLock<BTreeMap<String, String>>,
    batches: AtomicU64,
}

impl InMemoryKeyValueState {
    /// Creates a new empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a state pre-populated with `entries`.
    #[must_use]
    pub fn with_entries<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let map = entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            entries: RwLock::new(map),
            batches: AtomicU64::new(0),
        }
    }

    /// Returns how many batches have been written.
    #[must_use]
    pub fn batches_written(&self) -> u64 {
        self.batches.load(Ordering::SeqCst)
    }
}

impl KeyValueState for InMemoryKeyValueState {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn snapshot(&self) -> StorageResult<BTreeMap<String, String>> {
        Ok(self.entries.read().clone())
    }

    fn write_batch(&self, entries: &[(&str, &str)]) -> StorageResult<()> {
        let mut map = self.entries.write();
        for (key, value) in entries {
            map.insert((*key).to_string(), (*value).to_string());
        }
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove(&self, keys: &[&str]) -> StorageResult<()> {
        let mut map = self.entries.write();
        for key in keys {
            map.remove(*key);
        }
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_reads_none() {
        let state = InMemoryKeyValueState::new();
        assert_eq!(state.get("absent").unwrap(), None);
    }

    #[test]
    fn batch_overwrites_existing_values() {
        let state = InMemoryKeyValueState::with_entries([("a", "1"), ("b", "2")]);
        state.write_batch(&[("a", "10"), ("c", "30")]).unwrap();

        let snapshot = state.snapshot().unwrap();
        assert_eq!(snapshot.get("a").map(String::as_str), Some("10"));
        assert_eq!(snapshot.get("b").map(String::as_str), Some("2"));
        assert_eq!(snapshot.get("c").map(String::as_str), Some("30"));
        assert_eq!(state.batches_written(), 1);
    }

    #[test]
    fn remove_drops_keys() {
        let state = InMemoryKeyValueState::with_entries([("a", "1"), ("b", "2")]);
        state.remove(&["a"]).unwrap();
        assert_eq!(state.get("a").unwrap(), None);
        assert_eq!(state.get("b").unwrap().as_deref(), Some("2"));
    }
}
