//! File-backed key/value state.
//!
//! Layout of a state directory:
//!
//! ```text
//! <state_dir>/
//! ├─ LOCK            # Advisory lock for single-writer
//! ├─ state.cbor      # Current state (versioned CBOR map)
//! └─ state.cbor.tmp  # Transient, only during a write
//! ```
//!
//! Every batch rewrites the whole file with the write-then-rename pattern,
//! so a crash leaves either the previous or the new file in place.

use crate::backend::KeyValueState;
use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Name of the state file inside the state directory.
pub const STATE_FILE_NAME: &str = "state.cbor";
const LOCK_FILE: &str = "LOCK";
const FORMAT_VERSION: u16 = 1;

#[derive(Serialize, Deserialize)]
struct StateFile {
    format_version: u16,
    entries: BTreeMap<String, String>,
}

/// A persistent key/value state stored in a single file.
///
/// The directory holds an exclusive advisory lock for the lifetime of the
/// value, so only one process can own the state at a time.
///
/// # Example
///
/// ```no_run
/// use healthsync_storage::{FileKeyValueState, KeyValueState};
/// use std::path::Path;
///
/// let state = FileKeyValueState::open(Path::new("restore_state")).unwrap();
/// state.set("phase", "2").unwrap();
/// ```
#[derive(Debug)]
pub struct FileKeyValueState {
    dir: PathBuf,
    entries: RwLock<BTreeMap<String, String>>,
    _lock_file: File,
}

impl FileKeyValueState {
    /// Opens or creates a state directory.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - Another process holds the lock (returns `Locked`)
    /// - An existing state file cannot be decoded (returns `Corrupted`)
    pub fn open(dir: &Path) -> StorageResult<Self> {
        fs::create_dir_all(dir)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked);
        }

        let entries = load_entries(&dir.join(STATE_FILE_NAME))?;
        tracing::debug!(path = %dir.display(), keys = entries.len(), "opened state directory");

        Ok(Self {
            dir: dir.to_path_buf(),
            entries: RwLock::new(entries),
            _lock_file: lock_file,
        })
    }

    /// Returns the state directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> StorageResult<()> {
        let file = StateFile {
            format_version: FORMAT_VERSION,
            entries: entries.clone(),
        };
        let mut data = Vec::new();
        ciborium::into_writer(&file, &mut data)
            .map_err(|e| StorageError::Encoding(e.to_string()))?;
        atomic_write(&self.dir, STATE_FILE_NAME, &data)
    }
}

fn load_entries(path: &Path) -> StorageResult<BTreeMap<String, String>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let data = fs::read(path)?;
    if data.is_empty() {
        return Ok(BTreeMap::new());
    }
    let file: StateFile = ciborium::from_reader(data.as_slice())
        .map_err(|e| StorageError::corrupted(format!("{}: {e}", path.display())))?;
    if file.format_version != FORMAT_VERSION {
        return Err(StorageError::corrupted(format!(
            "unsupported state format version {}",
            file.format_version
        )));
    }
    Ok(file.entries)
}

impl KeyValueState for FileKeyValueState {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn snapshot(&self) -> StorageResult<BTreeMap<String, String>> {
        Ok(self.entries.read().clone())
    }

    fn write_batch(&self, entries: &[(&str, &str)]) -> StorageResult<()> {
        let mut current = self.entries.write();
        let mut next = current.clone();
        for (key, value) in entries {
            next.insert((*key).to_string(), (*value).to_string());
        }
        self.persist(&next)?;
        *current = next;
        Ok(())
    }

    fn remove(&self, keys: &[&str]) -> StorageResult<()> {
        let mut current = self.entries.write();
        let mut next = current.clone();
        for key in keys {
            next.remove(*key);
        }
        self.persist(&next)?;
        *current = next;
        Ok(())
    }
}

/// Writes `data` to `dir/file_name` atomically.
///
/// 1. Write to `file_name.tmp`
/// 2. Sync the temporary file to disk
/// 3. Rename over the target
/// 4. Fsync the directory so the rename is durable
///
/// # Errors
///
/// Returns an error if any step fails. The target is left untouched.
pub fn atomic_write(dir: &Path, file_name: &str, data: &[u8]) -> StorageResult<()> {
    let target = dir.join(file_name);
    let temp = dir.join(format!("{file_name}.tmp"));

    let mut file = File::create(&temp)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp, &target)?;
    sync_directory(dir)
}

/// Fsyncs a directory so entry creation, rename and removal are durable.
///
/// NTFS journals metadata, so this is a no-op off Unix.
#[cfg(unix)]
pub fn sync_directory(dir: &Path) -> StorageResult<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// Fsyncs a directory so entry creation, rename and removal are durable.
///
/// NTFS journals metadata, so this is a no-op off Unix.
#[cfg(not(unix))]
pub fn sync_directory(_dir: &Path) -> StorageResult<()> {
    Ok(())
}
