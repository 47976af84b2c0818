//! GistVault Core Library
//!
//! Encrypted storage for TOTP/HOTP secrets and account credentials, with
//! backup and cross-device sync through a private GitHub Gist that only
//! ever sees ciphertext.
//!
//! The host application supplies a [`storage::KeyValueStore`] and an access
//! token; everything else (field encryption, the backup codec, the remote
//! sync session and the PIN gate) lives here.

pub mod accounts;
pub mod backup;
pub mod config;
pub mod crypto;
pub mod lockout;
pub mod pin;
pub mod platform;
pub mod remote;
pub mod storage;
pub mod sync;
pub mod totp;

pub use accounts::{
    AccountDraft, AccountRecord, AccountStore, IntegrityReport, RevealedAccount, StoredAccount,
};
pub use backup::{BackupDocument, ExportedBackup};
pub use config::VaultConfig;
pub use crypto::keyring::{CipherKey, KeyRing, MasterKey, MasterKeySource};
pub use crypto::{decrypt, encrypt_string, CipherPayload, CryptoError};
pub use pin::{PinGate, PinState, VerifyOutcome};
pub use remote::{GistClient, MemoryRemote, RemoteFault, RemoteObject, RemoteStore};
pub use storage::{KeyValueStore, MemoryStore, SqliteStore};
pub use sync::{
    BackupHistoryEntry, BackupReceipt, PollOutcome, RestoreReport, SyncOrchestrator, SyncSession,
    SyncSettings, SyncStatus, TaskState,
};

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type for vault operations
pub type Result<T> = std::result::Result<T, VaultError>;

/// General error type for vault operations
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Cannot decrypt field '{field}': {source}")]
    Field {
        field: &'static str,
        #[source]
        source: crypto::CryptoError,
    },

    #[error("Unrecognized backup format (starts with {preview:?})")]
    UnrecognizedFormat { preview: String },

    #[error("Remote object not found: {0}")]
    RemoteNotFound(String),

    #[error("Remote rejected credentials: {0}")]
    RemoteAuth(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Too many failed attempts; locked out until {until}")]
    LockedOut { until: DateTime<Utc> },

    #[error("No PIN is configured")]
    NoPin,

    #[error("Nothing to export: the vault has no accounts")]
    NothingToExport,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl VaultError {
    /// Attach the name of the record field a crypto failure came from.
    pub fn in_field(field: &'static str, source: crypto::CryptoError) -> Self {
        VaultError::Field { field, source }
    }

    /// True for failures that a background loop should simply retry later.
    pub fn is_transient(&self) -> bool {
        matches!(self, VaultError::Network(_) | VaultError::Storage(_))
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(e: serde_json::Error) -> Self {
        VaultError::Serialization(e.to_string())
    }
}

/// First `max` characters of `input`, for error messages that must not echo
/// whole ciphertexts or secrets.
pub(crate) fn preview(input: &str, max: usize) -> String {
    input.chars().take(max).collect()
}
