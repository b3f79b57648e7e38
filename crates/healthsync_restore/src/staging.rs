//! Staging area for remote backup files.

use crate::error::{RestoreError, RestoreResult};
use healthsync_core::{GrantTimeState, MemoryRecordStore};
use healthsync_storage::atomic_write;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// File name of the staged database snapshot.
pub const STAGED_DATABASE_NAME: &str = "healthsync_staged.db";
/// File name of the staged grant-time blob.
pub const GRANT_TIME_FILE_NAME: &str = "health-permissions-first-grant-times.json";

/// Returns the names of the files making up a backup.
///
/// Cloud backups only carry the grant-time blob; device transfers also
/// carry the whole database.
pub fn backup_file_names(for_device_transfer: bool) -> Vec<&'static str> {
    if for_device_transfer {
        vec![STAGED_DATABASE_NAME, GRANT_TIME_FILE_NAME]
    } else {
        vec![GRANT_TIME_FILE_NAME]
    }
}

/// Directory holding staged files until a merge consumes them.
#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    /// Creates a staging area rooted at `dir`. Nothing is created on disk.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the staging directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the path of the staged database.
    pub fn staged_database_path(&self) -> PathBuf {
        self.dir.join(STAGED_DATABASE_NAME)
    }

    /// Returns the path of the staged grant-time blob.
    pub fn grant_time_path(&self) -> PathBuf {
        self.dir.join(GRANT_TIME_FILE_NAME)
    }

    /// Copies `source` into the staging area under `name`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownStagedFile` for names that are not part of a backup,
    /// or an I/O error if the copy fails.
    pub fn stage_file(&self, name: &str, source: &Path) -> RestoreResult<()> {
        if !backup_file_names(true).contains(&name) {
            return Err(RestoreError::UnknownStagedFile(name.to_string()));
        }
        let bytes = fs::read(source)?;
        fs::create_dir_all(&self.dir)?;
        atomic_write(&self.dir, name, &bytes)?;
        tracing::debug!(file = name, bytes = bytes.len(), "staged remote file");
        Ok(())
    }

    /// Returns the backup files currently staged.
    pub fn staged_file_names(&self) -> Vec<String> {
        backup_file_names(true)
            .into_iter()
            .filter(|name| self.dir.join(name).is_file())
            .map(str::to_string)
            .collect()
    }

    /// Opens the staged database, if one was staged.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be opened.
    pub fn open_staged_database(&self) -> RestoreResult<Option<MemoryRecordStore>> {
        let path = self.staged_database_path();
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(MemoryRecordStore::open_snapshot(&path)?))
    }

    /// Reads the staged grant-time blob, if one was staged.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be decoded.
    pub fn read_grant_times(&self) -> RestoreResult<Option<GrantTimeState>> {
        match fs::read(self.grant_time_path()) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes every staged file.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be removed.
    pub fn clear(&self) -> RestoreResult<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {
                tracing::debug!(dir = %self.dir.display(), "cleared staging area");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Writes the grant-time blob as `dir/GRANT_TIME_FILE_NAME`.
pub(crate) fn write_grant_times(dir: &Path, state: &GrantTimeState) -> RestoreResult<()> {
    let bytes = serde_json::to_vec(state)?;
    fs::create_dir_all(dir)?;
    atomic_write(dir, GRANT_TIME_FILE_NAME, &bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn backup_file_names_by_transport() {
        assert_eq!(backup_file_names(false), vec![GRANT_TIME_FILE_NAME]);
        assert_eq!(
            backup_file_names(true),
            vec![STAGED_DATABASE_NAME, GRANT_TIME_FILE_NAME]
        );
    }

    #[test]
    fn stage_and_clear() {
        let dir = tempdir().unwrap();
        let incoming = dir.path().join("incoming");
        write_grant_times(&incoming, &GrantTimeState::default().with_package("a", 5)).unwrap();

        let staging = StagingArea::new(dir.path().join("staged"));
        assert!(staging.staged_file_names().is_empty());
        assert!(staging.read_grant_times().unwrap().is_none());

        staging
            .stage_file(GRANT_TIME_FILE_NAME, &incoming.join(GRANT_TIME_FILE_NAME))
            .unwrap();
        assert_eq!(staging.staged_file_names(), vec![GRANT_TIME_FILE_NAME.to_string()]);
        let grants = staging.read_grant_times().unwrap().unwrap();
        assert_eq!(grants.package_grant_times.get("a"), Some(&5));

        staging.clear().unwrap();
        assert!(staging.staged_file_names().is_empty());
        staging.clear().unwrap();
    }

    #[test]
    fn unknown_file_is_rejected() {
        let dir = tempdir().unwrap();
        let staging = StagingArea::new(dir.path().join("staged"));
        let err = staging
            .stage_file("passwords.txt", &dir.path().join("x"))
            .unwrap_err();
        assert!(matches!(err, RestoreError::UnknownStagedFile(_)));
    }

    #[test]
    fn missing_database_is_none() {
        let dir = tempdir().unwrap();
        let staging = StagingArea::new(dir.path());
        assert!(staging.open_staged_database().unwrap().is_none());
    }
}
