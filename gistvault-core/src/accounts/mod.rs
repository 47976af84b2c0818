//! Account records and the index that lists them.
//!
//! Each account lives under its own key (`account_<uuid>`). The index under
//! `accounts_index` is the single source of truth for which accounts exist.
//! Writes are ordered so that an interruption leaves at worst a leaked
//! record (present but unindexed), never an orphan index entry; both are
//! detected by [`AccountStore::check_integrity`] and fixed by
//! [`AccountStore::repair`].

use crate::crypto::token::{cache_key, is_short_token, resolve_token, store_cipher};
use crate::crypto::{self, encrypt_string, CipherKey};
use crate::storage::{keys, KeyValueStore};
use crate::{Result, VaultError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;


/// Inline ciphertexts longer than this are stored behind a short token.
pub const DEFAULT_TOKEN_THRESHOLD: usize = 256;

/// Callback fired after every local mutation.
pub type ChangeHook = Arc<dyn Fn() + Send + Sync>;

/// A stored account. `password` and `otp_uri` hold cipher references when
/// `encrypted` is set, plaintext otherwise (records from before encryption).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRecord {
    pub account_name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub otp_uri: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub encrypted: bool,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub is_favorite: bool,
}

/// Plaintext input for creating or editing an account.
#[derive(Debug, Clone, Default)]
pub struct AccountDraft {
    pub account_name: String,
    pub username: String,
    pub password: String,
    pub otp_uri: String,
    pub notes: String,
    pub is_favorite: bool,
}

/// An account with its secret fields decrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevealedAccount {
    pub key: String,
    pub account_name: String,
    pub username: String,
    pub password: String,
    pub otp_uri: String,
    pub notes: String,
    pub is_favorite: bool,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// A record together with its storage key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAccount {
    pub key: String,
    pub record: AccountRecord,
}

/// Disagreements between the index and the stored records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    /// Indexed keys with no record behind them.
    pub orphans: Vec<String>,
    /// Records that the index does not list.
    pub leaks: Vec<String>,
    /// Keys listed more than once in the index.
    pub duplicates: Vec<String>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.orphans.is_empty() && self.leaks.is_empty() && self.duplicates.is_empty()
    }
}

/// Account persistence on top of a [`KeyValueStore`].
pub struct AccountStore {
    store: Arc<dyn KeyValueStore>,
    field_key: Arc<CipherKey>,
    token_threshold: usize,
    on_change: RwLock<Option<ChangeHook>>,
}

impl AccountStore {
    pub fn new(store: Arc<dyn KeyValueStore>, field_key: Arc<CipherKey>) -> Self {
        Self {
            store,
            field_key,
            token_threshold: DEFAULT_TOKEN_THRESHOLD,
            on_change: RwLock::new(None),
        }
    }

    pub fn with_token_threshold(mut self, threshold: usize) -> Self {
        self.token_threshold = threshold;
        self
    }

    pub fn kv(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// Install the callback run after every add/update/remove.
    pub fn set_change_hook(&self, hook: ChangeHook) {
        if let Ok(mut slot) = self.on_change.write() {
            *slot = Some(hook);
        }
    }

    fn notify_changed(&self) {
        let hook = self.on_change.read().ok().and_then(|slot| slot.clone());
        if let Some(hook) = hook {
            hook();
        }
    }

    /// Read the account index.
    pub async fn index(&self) -> Result<Vec<String>> {
        match self.store.get(keys::ACCOUNT_INDEX).await? {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| {
                VaultError::Serialization(format!("account index is corrupt: {}", e))
            }),
            None => Ok(Vec::new()),
        }
    }

    async fn write_index(&self, index: &[String]) -> Result<()> {
        let raw = serde_json::to_string(index)?;
        self.store.set(keys::ACCOUNT_INDEX, &raw).await
    }

    pub async fn count(&self) -> Result<usize> {
        Ok(self.index().await?.len())
    }

    /// Read one record.
    pub async fn get(&self, key: &str) -> Result<Option<AccountRecord>> {
        match self.store.get(key).await? {
            Some(raw) => serde_json::from_str(&raw).map(Some).map_err(|e| {
                VaultError::Serialization(format!("record '{}' is corrupt: {}", key, e))
            }),
            None => Ok(None),
        }
    }

    /// All indexed records in index order. Unreadable records are skipped.
    pub async fn list(&self) -> Result<Vec<StoredAccount>> {
        let mut accounts = Vec::new();
        for key in self.index().await? {
            match self.get(&key).await {
                Ok(Some(record)) => accounts.push(StoredAccount { key, record }),
                Ok(None) => warn!(key = %key, "Indexed account has no record"),
                Err(e) => warn!(key = %key, error = %e, "Skipping unreadable account"),
            }
        }
        Ok(accounts)
    }

    /// Create an account and return its key.
    pub async fn add(&self, draft: &AccountDraft) -> Result<String> {
        validate_draft(draft)?;

        let now = Utc::now();
        let record = AccountRecord {
            account_name: draft.account_name.trim().to_string(),
            username: draft.username.clone(),
            password: self.seal(&draft.password).await?,
            otp_uri: self.seal(&draft.otp_uri).await?,
            notes: draft.notes.clone(),
            encrypted: true,
            created_at: now,
            modified_at: now,
            is_favorite: draft.is_favorite,
        };

        let key = format!("{}{}", keys::ACCOUNT_PREFIX, Uuid::new_v4().simple());

        // Record first, index second: a crash in between leaves a leak.
        self.write_record(&key, &record).await?;
        let mut index = self.index().await?;
        index.push(key.clone());
        self.write_index(&index).await?;

        info!(key = %key, "Account added");
        self.notify_changed();
        Ok(key)
    }

    /// Replace the editable fields of an existing account.
    pub async fn update(&self, key: &str, draft: &AccountDraft) -> Result<()> {
        validate_draft(draft)?;

        if !self.index().await?.iter().any(|k| k == key) {
            return Err(VaultError::NotFound(format!("account '{}'", key)));
        }
        let previous = self
            .get(key)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("account '{}'", key)))?;

        let record = AccountRecord {
            account_name: draft.account_name.trim().to_string(),
            username: draft.username.clone(),
            password: self.seal(&draft.password).await?,
            otp_uri: self.seal(&draft.otp_uri).await?,
            notes: draft.notes.clone(),
            encrypted: true,
            created_at: previous.created_at,
            modified_at: Utc::now(),
            is_favorite: draft.is_favorite,
        };

        self.write_record(key, &record).await?;
        self.release_refs(&previous).await;

        info!(key = %key, "Account updated");
        self.notify_changed();
        Ok(())
    }

    /// Toggle the favorite flag without touching secrets.
    pub async fn set_favorite(&self, key: &str, favorite: bool) -> Result<()> {
        let mut record = self
            .get(key)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("account '{}'", key)))?;
        record.is_favorite = favorite;
        record.modified_at = Utc::now();
        self.write_record(key, &record).await?;
        self.notify_changed();
        Ok(())
    }

    /// Delete an account.
    pub async fn remove(&self, key: &str) -> Result<()> {
        let mut index = self.index().await?;
        let before = index.len();
        index.retain(|k| k != key);
        if index.len() == before {
            return Err(VaultError::NotFound(format!("account '{}'", key)));
        }

        // Index first, record second: a crash in between leaves a leak.
        self.write_index(&index).await?;
        if let Ok(Some(record)) = self.get(key).await {
            self.release_refs(&record).await;
        }
        self.store.delete(key).await?;

        info!(key = %key, "Account removed");
        self.notify_changed();
        Ok(())
    }

    /// Decrypt the secret fields of an account.
    pub async fn reveal(&self, key: &str) -> Result<RevealedAccount> {
        let record = self
            .get(key)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("account '{}'", key)))?;

        let (password, otp_uri) = if record.encrypted {
            (
                self.open_field("password", &record.password).await?,
                self.open_field("otpUri", &record.otp_uri).await?,
            )
        } else {
            (record.password.clone(), record.otp_uri.clone())
        };

        Ok(RevealedAccount {
            key: key.to_string(),
            account_name: record.account_name,
            username: record.username,
            password,
            otp_uri,
            notes: record.notes,
            is_favorite: record.is_favorite,
            created_at: record.created_at,
            modified_at: record.modified_at,
        })
    }

    /// Copy of `record` with every short token replaced by its inline cipher,
    /// so the record can leave this device.
    pub async fn inline_refs(&self, record: &AccountRecord) -> Result<AccountRecord> {
        let mut out = record.clone();
        if record.encrypted {
            out.password = self.inline_field("password", &record.password).await?;
            out.otp_uri = self.inline_field("otpUri", &record.otp_uri).await?;
        }
        Ok(out)
    }

    /// Replace every local account with `records`.
    ///
    /// Accounts missing from `records` are deleted, all incoming records are
    /// written (releasing tokens the overwritten record held), then the index
    /// is rewritten. Order follows `order` where it
    /// names incoming keys; remaining keys are appended in key order.
    pub async fn replace_all(
        &self,
        order: &[String],
        records: &BTreeMap<String, AccountRecord>,
    ) -> Result<usize> {
        if let Some(bad) = records.keys().find(|k| is_reserved_key(k)) {
            return Err(VaultError::InvalidInput(format!(
                "backup contains reserved key '{}'",
                bad
            )));
        }

        for key in self.index().await? {
            if records.contains_key(&key) {
                continue;
            }
            if let Ok(Some(record)) = self.get(&key).await {
                self.release_refs(&record).await;
            }
            self.store.delete(&key).await?;
            debug!(key = %key, "Removed account absent from backup");
        }

        for (key, record) in records {
            let previous = self.get(key).await.ok().flatten();
            self.write_record(key, record).await?;
            if let Some(previous) = previous {
                self.release_refs_except(&previous, Some(record)).await;
            }
        }

        let mut seen = HashSet::new();
        let mut index: Vec<String> = order
            .iter()
            .filter(|k| records.contains_key(*k) && seen.insert((*k).clone()))
            .cloned()
            .collect();
        for key in records.keys() {
            if seen.insert(key.clone()) {
                index.push(key.clone());
            }
        }
        self.write_index(&index).await?;

        Ok(index.len())
    }

    /// Compare the index against the records present in storage.
    pub async fn check_integrity(&self) -> Result<IntegrityReport> {
        let index = self.index().await?;
        let mut report = IntegrityReport::default();

        let mut seen = HashSet::new();
        for key in &index {
            if !seen.insert(key.clone()) {
                report.duplicates.push(key.clone());
                continue;
            }
            if self.store.get(key).await?.is_none() {
                report.orphans.push(key.clone());
            }
        }

        for key in self.store.keys_with_prefix(keys::ACCOUNT_PREFIX).await? {
            if !seen.contains(&key) {
                report.leaks.push(key);
            }
        }

        Ok(report)
    }

    /// Drop orphans and duplicates from the index and re-index leaked records.
    pub async fn repair(&self) -> Result<IntegrityReport> {
        let report = self.check_integrity().await?;
        if report.is_clean() {
            return Ok(report);
        }

        let orphans: HashSet<&String> = report.orphans.iter().collect();
        let mut seen = HashSet::new();
        let mut index: Vec<String> = self
            .index()
            .await?
            .into_iter()
            .filter(|k| !orphans.contains(k) && seen.insert(k.clone()))
            .collect();
        index.extend(report.leaks.iter().cloned());
        self.write_index(&index).await?;

        warn!(
            orphans = report.orphans.len(),
            leaks = report.leaks.len(),
            duplicates = report.duplicates.len(),
            "Repaired account index"
        );
        self.notify_changed();
        Ok(report)
    }

    async fn write_record(&self, key: &str, record: &AccountRecord) -> Result<()> {
        let raw = serde_json::to_string(record)?;
        self.store.set(key, &raw).await
    }

    /// Encrypt a secret field; large ciphertexts go behind a short token.
    async fn seal(&self, plaintext: &str) -> Result<String> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }
        let cipher = encrypt_string(&self.field_key, plaintext)?;
        if cipher.len() > self.token_threshold {
            return store_cipher(self.store.as_ref(), &cipher).await;
        }
        Ok(cipher)
    }

    async fn open_field(&self, field: &'static str, value: &str) -> Result<String> {
        if value.is_empty() {
            return Ok(String::new());
        }
        crypto::decrypt(self.store.as_ref(), &self.field_key, value)
            .await
            .map_err(|e| match e {
                VaultError::Crypto(source) => VaultError::in_field(field, source),
                other => other,
            })
    }

    async fn inline_field(&self, field: &'static str, value: &str) -> Result<String> {
        if !is_short_token(value) {
            return Ok(value.to_string());
        }
        resolve_token(self.store.as_ref(), value)
            .await
            .map_err(|e| match e {
                VaultError::Crypto(source) => VaultError::in_field(field, source),
                other => other,
            })
    }

    /// Best-effort removal of token cache entries owned by `record`.
    async fn release_refs(&self, record: &AccountRecord) {
        self.release_refs_except(record, None).await
    }

    /// Drop the cached ciphertexts behind `record`'s tokens, keeping any
    /// token that `keep` still points at.
    async fn release_refs_except(&self, record: &AccountRecord, keep: Option<&AccountRecord>) {
        for value in [&record.password, &record.otp_uri] {
            if !record.encrypted || !is_short_token(value) {
                continue;
            }
            if keep.is_some_and(|k| k.password == *value || k.otp_uri == *value) {
                continue;
            }
            if let Err(e) = self.store.delete(&cache_key(value)).await {
                warn!(error = %e, "Failed to drop cached ciphertext");
            }
        }
    }
}

fn validate_draft(draft: &AccountDraft) -> Result<()> {
    if draft.account_name.trim().is_empty() {
        return Err(VaultError::InvalidInput(
            "Account name cannot be empty".to_string(),
        ));
    }
    Ok(())
}

fn is_reserved_key(key: &str) -> bool {
    key.is_empty()
        || key == keys::ACCOUNT_INDEX
        || key == keys::DEVICE_MASTER_KEY
        || key == keys::PIN_CREDENTIAL
        || key.starts_with(keys::CIPHER_PREFIX)
        || key.starts_with("sync_")
}
