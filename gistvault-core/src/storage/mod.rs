//! Local key-value persistence.
//!
//! The host platform owns the actual storage; the core only needs string
//! `get/set/delete`. There are no transactions and no locking, so callers
//! order their writes so that a crash leaves recoverable state.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::Result;
use async_trait::async_trait;

/// Well-known keys shared by the modules that persist into the store.
pub mod keys {
    /// Ordered list of account record keys (JSON array).
    pub const ACCOUNT_INDEX: &str = "accounts_index";
    /// Prefix of every account record key.
    pub const ACCOUNT_PREFIX: &str = "account_";
    /// Prefix of content-addressed ciphertexts behind a short token.
    pub const CIPHER_PREFIX: &str = "cipher_";
    /// Random master key used when no access token is configured.
    pub const DEVICE_MASTER_KEY: &str = "master_key_device";
    /// Salted PIN hash.
    pub const PIN_CREDENTIAL: &str = "pin_credential";
    /// Id of the remote backup object last written or located.
    pub const REMOTE_ID: &str = "sync_remote_id";
    /// RFC 3339 timestamp of the last successful backup.
    pub const LAST_BACKUP_AT: &str = "sync_last_backup_at";
    /// JSON array of recent backups, newest first.
    pub const BACKUP_HISTORY: &str = "sync_backup_history";
}

/// Asynchronous string key-value store supplied by the platform.
///
/// Every method may fail with [`crate::VaultError::Storage`].
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// List keys starting with `prefix`.
    ///
    /// Only used for integrity checks. Platforms that cannot enumerate keep
    /// the default, in which case leaked records are simply not reported.
    async fn keys_with_prefix(&self, _prefix: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}
