//! Entry points of the cloud backup protocol.

use crate::applier::{CloudRestoreApplier, RestoreStats};
use crate::config::CloudConfig;
use crate::error::{CloudError, CloudResult};
use crate::messages::{AppMetadata, BackupSettings, GetChangesForBackupResponse, RestoreChange};
use crate::token::BackupChangeToken;
use crate::walker::CloudBackupWalker;
use healthsync_core::{from_cbor, to_cbor, HealthDataCategory, RecordStore, RecordStoreExt};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Serves backup pages and applies restores against one record store.
///
/// Every call is stateless: progress lives entirely in the tokens handed
/// to the caller.
pub struct CloudBackupManager {
    store: Arc<dyn RecordStore>,
    config: CloudConfig,
}

impl CloudBackupManager {
    /// Creates a manager over `store`.
    pub fn new(store: Arc<dyn RecordStore>, config: CloudConfig) -> Self {
        Self { store, config }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &CloudConfig {
        &self.config
    }

    /// Returns a walker over the store.
    pub fn walker(&self) -> CloudBackupWalker<'_> {
        CloudBackupWalker::new(&*self.store, &self.config)
    }

    /// Returns the next page of changes to back up.
    ///
    /// A missing or empty token starts a full backup. If the token's
    /// change-log position was purged the response is empty and carries an
    /// empty token, telling the caller to start over.
    ///
    /// # Errors
    ///
    /// Returns `InvalidToken` for an unknown token, or an error if the
    /// store cannot be read or the next token cannot be stored.
    pub fn get_changes_for_backup(
        &self,
        change_token: Option<&str>,
    ) -> CloudResult<GetChangesForBackupResponse> {
        let walker = self.walker();
        let token = match change_token.filter(|t| !t.is_empty()) {
            Some(id) => Some(BackupChangeToken::load(&*self.store, id)?),
            None => None,
        };

        let page = match token {
            None => {
                tracing::info!("starting full backup");
                walker.changes_from_data_tables(None)?
            }
            Some(token) if !walker.is_change_logs_token_valid(Some(&token))? => {
                tracing::warn!(
                    cursor = ?token.change_log_cursor,
                    "backup token outlived the change log, full backup required"
                );
                return Ok(GetChangesForBackupResponse {
                    version: self.config.data_version,
                    changes: Vec::new(),
                    next_change_token: String::new(),
                });
            }
            Some(token) if token.is_walking_tables() => {
                walker.changes_from_data_tables(Some(&token))?
            }
            Some(token) => walker.incremental_changes(token.change_log_cursor)?,
        };

        let next_change_token = page.token.persist(&*self.store)?;
        tracing::debug!(
            changes = page.changes.len(),
            next = %next_change_token,
            "backup page ready"
        );
        Ok(GetChangesForBackupResponse {
            version: self.config.data_version,
            changes: page.changes,
            next_change_token,
        })
    }

    /// Returns the settings to back up.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn get_settings_for_backup(&self) -> CloudResult<BackupSettings> {
        Ok(BackupSettings {
            version: self.config.data_version,
            data: to_cbor(&self.store.priority_lists()?)?,
        })
    }

    /// Overwrites the priority lists named in `settings`.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedVersion` for settings newer than this build, or
    /// an error if they cannot be decoded or written.
    pub fn restore_settings(&self, settings: &BackupSettings) -> CloudResult<()> {
        if !self.can_restore(settings.version) {
            return Err(CloudError::UnsupportedVersion {
                version: settings.version,
                supported: self.config.data_version,
            });
        }
        let lists: BTreeMap<HealthDataCategory, Vec<String>> = from_cbor(&settings.data)?;
        let count = lists.len();
        self.store.write(|txn| {
            for (category, packages) in lists {
                txn.set_priority_list(category, packages)?;
            }
            Ok(())
        })?;
        tracing::info!(categories = count, "restored settings");
        Ok(())
    }

    /// Returns true if data of `data_version` can be restored.
    pub fn can_restore(&self, data_version: u32) -> bool {
        data_version <= self.config.data_version
    }

    /// Returns the encoded package name to metadata map of every known app.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn app_info_for_backup(&self) -> CloudResult<Vec<u8>> {
        let apps: BTreeMap<String, AppMetadata> = self
            .store
            .app_infos()?
            .into_iter()
            .map(|app| {
                (
                    app.package_name,
                    AppMetadata {
                        app_name: app.app_name,
                    },
                )
            })
            .collect();
        Ok(to_cbor(&apps)?)
    }

    /// Applies restored changes. See [`CloudRestoreApplier::restore_changes`].
    ///
    /// # Errors
    ///
    /// Returns an error if nothing could be applied.
    pub fn restore_changes(
        &self,
        changes: &[RestoreChange],
        app_info: &[u8],
    ) -> CloudResult<RestoreStats> {
        CloudRestoreApplier::new(&*self.store).restore_changes(changes, app_info)
    }
}
