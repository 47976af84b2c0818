//! Remote sync orchestrator: locate, push, pull and poll checks.
//!
//! All remote writes and restores run under one async mutex so that at most
//! one push or pull touches the remote object at a time.

use super::config::{BackupHistoryEntry, SyncMetadata, SyncSettings};
use super::task::CancelToken;
use crate::accounts::AccountStore;
use crate::backup;
use crate::crypto::{KeyRing, MasterKeySource};
use crate::remote::{RemoteObject, RemoteStore};
use crate::{Result, VaultError};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Shown wherever a device-local master key is in use.
pub const DEVICE_LOCAL_WARNING: &str =
    "Backups are encrypted with a key that exists only on this device and cannot be restored elsewhere";

/// Successful push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupReceipt {
    pub remote_id: String,
    pub updated_at: DateTime<Utc>,
    pub account_count: usize,
    /// True when a new remote object was created.
    pub created: bool,
    /// Accounts left out because they could not be read.
    pub skipped: Vec<String>,
    pub master_key_source: MasterKeySource,
}

impl BackupReceipt {
    pub fn warning(&self) -> Option<&'static str> {
        key_warning(self.master_key_source)
    }
}

/// Successful pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub remote_id: String,
    pub updated_at: DateTime<Utc>,
    pub account_count: usize,
    pub master_key_source: MasterKeySource,
}

/// Result of one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// First poll since start; only the baseline was recorded.
    Baseline(Option<DateTime<Utc>>),
    Unchanged,
    Restored(RestoreReport),
    /// Stop was requested while the check was in flight; nothing was applied.
    Discarded,
}

/// Snapshot of sync state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub remote_id: Option<String>,
    pub last_backup_at: Option<DateTime<Utc>>,
    pub last_seen_remote_at: Option<DateTime<Utc>>,
    pub master_key_source: MasterKeySource,
    pub master_key_warning: Option<&'static str>,
    pub polling: bool,
    pub debounce: super::TaskState,
    pub poller: super::TaskState,
}

/// Remote timestamp the poller compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Baseline {
    Unset,
    Seen(Option<DateTime<Utc>>),
}

pub struct SyncOrchestrator {
    accounts: Arc<AccountStore>,
    remote: Arc<dyn RemoteStore>,
    keys: KeyRing,
    settings: SyncSettings,
    write_lock: tokio::sync::Mutex<()>,
    baseline: Mutex<Baseline>,
}

impl SyncOrchestrator {
    pub fn new(
        accounts: Arc<AccountStore>,
        remote: Arc<dyn RemoteStore>,
        keys: KeyRing,
        settings: SyncSettings,
    ) -> Self {
        Self {
            accounts,
            remote,
            keys,
            settings,
            write_lock: tokio::sync::Mutex::new(()),
            baseline: Mutex::new(Baseline::Unset),
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn accounts(&self) -> &Arc<AccountStore> {
        &self.accounts
    }

    pub fn master_key_source(&self) -> MasterKeySource {
        self.keys.master.source()
    }

    fn meta(&self) -> SyncMetadata<'_> {
        SyncMetadata::new(self.accounts.kv().as_ref())
    }

    fn filename(&self) -> &str {
        &self.settings.backup_filename
    }

    /// Find the newest remote object holding the backup file and cache its id.
    ///
    /// Scans listing pages until a short page; no match is `Ok(None)`.
    pub async fn locate(&self) -> Result<Option<RemoteObject>> {
        let per_page = self.settings.page_size.max(1);
        let mut best: Option<RemoteObject> = None;

        for page in 1..=self.settings.max_pages.max(1) {
            let objects = self.remote.list_objects(page, per_page).await?;
            let last_page = objects.len() < per_page as usize;

            for object in objects {
                if !object.has_file(self.filename()) {
                    continue;
                }
                if best.as_ref().map_or(true, |b| object.updated_at > b.updated_at) {
                    best = Some(object);
                }
            }

            if last_page {
                break;
            }
        }

        match &best {
            Some(object) => {
                debug!(id = %object.id, "Located remote backup");
                self.meta().set_remote_id(&object.id).await?;
            }
            None => debug!("No remote backup found"),
        }
        Ok(best)
    }

    /// The cached remote object if it still exists and holds the backup file.
    /// A stale cached id is forgotten.
    async fn verified_cached(&self) -> Result<Option<RemoteObject>> {
        let Some(id) = self.meta().remote_id().await? else {
            return Ok(None);
        };

        match self.remote.get_object(&id).await {
            Ok(object) if object.has_file(self.filename()) => Ok(Some(object)),
            Ok(_) | Err(VaultError::RemoteNotFound(_)) => {
                info!(id = %id, "Cached remote backup is gone; forgetting it");
                self.meta().clear_remote_id().await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Cached object, else a fresh locate.
    async fn resolve_target(&self) -> Result<Option<RemoteObject>> {
        if let Some(object) = self.verified_cached().await? {
            return Ok(Some(object));
        }
        self.locate().await
    }

    /// Export the vault and write it to the remote object, creating one when
    /// none exists.
    pub async fn push(&self) -> Result<BackupReceipt> {
        let _guard = self.write_lock.lock().await;
        self.push_locked().await
    }

    async fn push_locked(&self) -> Result<BackupReceipt> {
        let exported = backup::export(&self.accounts, self.keys.master.key()).await?;
        if exported.account_count == 0 {
            return Err(VaultError::NothingToExport);
        }

        let target = self.resolve_target().await?;
        let (object, created) = match target {
            Some(existing) => {
                match self
                    .remote
                    .update_object(&existing.id, self.filename(), &exported.blob)
                    .await
                {
                    Ok(object) => (object, false),
                    Err(VaultError::RemoteNotFound(_)) => {
                        warn!(
                            id = %existing.id,
                            "Remote backup vanished during update; creating a new one"
                        );
                        self.meta().clear_remote_id().await?;
                        (self.create(&exported.blob).await?, true)
                    }
                    Err(e) => return Err(e),
                }
            }
            None => (self.create(&exported.blob).await?, true),
        };

        let receipt = BackupReceipt {
            remote_id: object.id.clone(),
            updated_at: object.updated_at,
            account_count: exported.account_count,
            created,
            skipped: exported.skipped,
            master_key_source: self.master_key_source(),
        };

        self.meta()
            .record_backup(
                BackupHistoryEntry {
                    remote_id: receipt.remote_id.clone(),
                    backed_up_at: Utc::now(),
                    account_count: receipt.account_count,
                    created,
                    master_key_source: receipt.master_key_source,
                },
                self.settings.history_limit,
            )
            .await?;
        self.set_baseline(Some(object.updated_at));

        info!(
            id = %receipt.remote_id,
            accounts = receipt.account_count,
            created,
            "Backup pushed"
        );
        if let Some(warning) = receipt.warning() {
            warn!("{}", warning);
        }
        Ok(receipt)
    }

    async fn create(&self, blob: &str) -> Result<RemoteObject> {
        self.remote
            .create_object(&self.settings.description, self.filename(), blob)
            .await
    }

    /// Restore the vault from `id`, or from the located backup when `None`.
    pub async fn pull(&self, id: Option<&str>) -> Result<RestoreReport> {
        let _guard = self.write_lock.lock().await;
        let object = match id {
            Some(id) => self.remote.get_object(id).await?,
            None => self.fetch_target().await?,
        };
        self.restore_from(&object).await
    }

    /// The located backup with contents.
    async fn fetch_target(&self) -> Result<RemoteObject> {
        let target = self
            .resolve_target()
            .await?
            .ok_or_else(|| VaultError::RemoteNotFound("no remote backup found".to_string()))?;

        // Listings carry no file content.
        if target.file_content(self.filename()).is_some() {
            Ok(target)
        } else {
            self.remote.get_object(&target.id).await
        }
    }

    async fn restore_from(&self, object: &RemoteObject) -> Result<RestoreReport> {
        let content = object.file_content(self.filename()).ok_or_else(|| {
            VaultError::RemoteNotFound(format!(
                "remote object {} has no file named {}",
                object.id,
                self.filename()
            ))
        })?;

        let count = backup::import(&self.accounts, self.keys.master.key(), content).await?;
        self.meta().set_remote_id(&object.id).await?;
        self.set_baseline(Some(object.updated_at));

        info!(id = %object.id, accounts = count, "Backup restored");
        Ok(RestoreReport {
            remote_id: object.id.clone(),
            updated_at: object.updated_at,
            account_count: count,
            master_key_source: self.master_key_source(),
        })
    }

    /// Update time of the current backup object, if any.
    pub async fn remote_updated_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.resolve_target().await?.map(|o| o.updated_at))
    }

    /// Forget the poll baseline so the next poll only records one.
    pub fn reset_baseline(&self) {
        if let Ok(mut baseline) = self.baseline.lock() {
            *baseline = Baseline::Unset;
        }
    }

    fn set_baseline(&self, seen: Option<DateTime<Utc>>) {
        if let Ok(mut baseline) = self.baseline.lock() {
            *baseline = Baseline::Seen(seen);
        }
    }

    fn baseline(&self) -> Baseline {
        self.baseline
            .lock()
            .map(|b| *b)
            .unwrap_or(Baseline::Unset)
    }

    /// Compare the remote timestamp with the baseline and restore on change.
    ///
    /// `on_restore` runs just before an import starts. If `cancel` fires
    /// while the check is in flight the result is discarded.
    pub async fn poll_once(
        &self,
        cancel: Option<&CancelToken>,
        on_restore: &(dyn Fn() + Send + Sync),
    ) -> Result<PollOutcome> {
        let _guard = self.write_lock.lock().await;
        let target = self.resolve_target().await?;
        let remote_at = target.as_ref().map(|o| o.updated_at);

        if cancel.is_some_and(CancelToken::is_cancelled) {
            return Ok(PollOutcome::Discarded);
        }

        match self.baseline() {
            Baseline::Unset => {
                self.set_baseline(remote_at);
                debug!(?remote_at, "Poll baseline recorded");
                Ok(PollOutcome::Baseline(remote_at))
            }
            Baseline::Seen(seen) if seen == remote_at => Ok(PollOutcome::Unchanged),
            Baseline::Seen(_) => {
                let Some(target) = target else {
                    // The backup disappeared; nothing to restore from.
                    self.set_baseline(None);
                    return Ok(PollOutcome::Unchanged);
                };
                info!(id = %target.id, "Remote backup changed; restoring");
                on_restore();
                let object = if target.file_content(self.filename()).is_some() {
                    target
                } else {
                    self.remote.get_object(&target.id).await?
                };
                if cancel.is_some_and(CancelToken::is_cancelled) {
                    return Ok(PollOutcome::Discarded);
                }
                Ok(PollOutcome::Restored(self.restore_from(&object).await?))
            }
        }
    }

    /// Capped backup history, newest first.
    pub async fn history(&self) -> Result<Vec<BackupHistoryEntry>> {
        self.meta().history().await
    }

    /// Persisted sync state. Task fields are filled in by the session.
    pub async fn status(&self) -> Result<SyncStatus> {
        let meta = self.meta();
        let source = self.master_key_source();
        Ok(SyncStatus {
            remote_id: meta.remote_id().await?,
            last_backup_at: meta.last_backup_at().await?,
            last_seen_remote_at: match self.baseline() {
                Baseline::Seen(at) => at,
                Baseline::Unset => None,
            },
            master_key_source: source,
            master_key_warning: key_warning(source),
            polling: false,
            debounce: super::TaskState::Idle,
            poller: super::TaskState::Idle,
        })
    }
}

fn key_warning(source: MasterKeySource) -> Option<&'static str> {
    (!source.is_portable()).then_some(DEVICE_LOCAL_WARNING)
}
