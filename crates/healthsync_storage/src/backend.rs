//! Key/value state trait definition.

use crate::error::StorageResult;
use std::collections::BTreeMap;

/// A durable map of stable string keys to string values.
///
/// Implementations are the single source of truth for the restore state
/// machine, so they must survive process termination at any point.
///
/// # Invariants
///
/// - `write_batch` is all-or-nothing: after a crash either every key of the
///   batch holds its new value or every key holds its old value
/// - A missing key reads as `None`
/// - Implementations must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::InMemoryKeyValueState`] - For testing
/// - [`super::FileKeyValueState`] - For persistent state
pub trait KeyValueState: Send + Sync {
    /// Returns the value stored for `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be read.
    fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// Returns a copy of every key/value pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be read.
    fn snapshot(&self) -> StorageResult<BTreeMap<String, String>>;

    /// Atomically writes every pair in `entries`.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch cannot be made durable. In that case
    /// none of the entries are visible.
    fn write_batch(&self, entries: &[(&str, &str)]) -> StorageResult<()>;

    /// Atomically removes every key in `keys`.
    ///
    /// # Errors
    ///
    /// Returns an error if the removal cannot be made durable.
    fn remove(&self, keys: &[&str]) -> StorageResult<()>;

    /// Writes a single pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the write cannot be made durable.
    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.write_batch(&[(key, value)])
    }
}
