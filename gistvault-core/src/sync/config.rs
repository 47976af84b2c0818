//! Sync settings and the sync metadata persisted in the local store.

use crate::crypto::MasterKeySource;
use crate::storage::{keys, KeyValueStore};
use crate::{Result, VaultError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Remote backup settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub api_base_url: String,
    /// Name of the single file holding the backup inside the remote object.
    pub backup_filename: String,
    /// Informational description set on newly created remote objects.
    pub description: String,
    /// Quiet period before an automatic backup.
    pub debounce_ms: u64,
    pub poll_interval_secs: u64,
    /// Maximum number of entries kept in the backup history.
    pub history_limit: usize,
    /// Objects requested per listing page (the Gist API caps this at 100).
    pub page_size: u32,
    /// Listing pages scanned when locating the backup.
    pub max_pages: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.github.com".to_string(),
            backup_filename: "gistvault-backup.txt".to_string(),
            description: "GistVault encrypted backup".to_string(),
            debounce_ms: 3_000,
            poll_interval_secs: 60,
            history_limit: 20,
            page_size: 100,
            max_pages: 5,
        }
    }
}

impl SyncSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

/// One successful backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupHistoryEntry {
    pub remote_id: String,
    pub backed_up_at: DateTime<Utc>,
    pub account_count: usize,
    /// True when the backup created a new remote object.
    #[serde(default)]
    pub created: bool,
    pub master_key_source: MasterKeySource,
}

/// Typed access to the `sync_*` keys.
pub(crate) struct SyncMetadata<'a> {
    store: &'a dyn KeyValueStore,
}

impl<'a> SyncMetadata<'a> {
    pub(crate) fn new(store: &'a dyn KeyValueStore) -> Self {
        Self { store }
    }

    pub(crate) async fn remote_id(&self) -> Result<Option<String>> {
        Ok(self
            .store
            .get(keys::REMOTE_ID)
            .await?
            .filter(|id| !id.trim().is_empty()))
    }

    pub(crate) async fn set_remote_id(&self, id: &str) -> Result<()> {
        self.store.set(keys::REMOTE_ID, id).await
    }

    pub(crate) async fn clear_remote_id(&self) -> Result<()> {
        self.store.delete(keys::REMOTE_ID).await
    }

    pub(crate) async fn last_backup_at(&self) -> Result<Option<DateTime<Utc>>> {
        match self.store.get(keys::LAST_BACKUP_AT).await? {
            Some(raw) => DateTime::parse_from_rfc3339(raw.trim())
                .map(|t| Some(t.with_timezone(&Utc)))
                .map_err(|e| VaultError::Serialization(format!("last backup time: {}", e))),
            None => Ok(None),
        }
    }

    /// Newest first.
    pub(crate) async fn history(&self) -> Result<Vec<BackupHistoryEntry>> {
        match self.store.get(keys::BACKUP_HISTORY).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    /// Persist a successful backup: id, timestamp and a capped history entry.
    pub(crate) async fn record_backup(
        &self,
        entry: BackupHistoryEntry,
        limit: usize,
    ) -> Result<()> {
        self.set_remote_id(&entry.remote_id).await?;
        self.store
            .set(keys::LAST_BACKUP_AT, &entry.backed_up_at.to_rfc3339())
            .await?;

        // A corrupt history log is replaced rather than blocking backups.
        let mut history = self.history().await.unwrap_or_default();
        history.insert(0, entry);
        history.truncate(limit.max(1));
        self.store
            .set(keys::BACKUP_HISTORY, &serde_json::to_string(&history)?)
            .await
    }
}
