//! Key material for field encryption and backups.
//!
//! Two keys are derived from the user's access token:
//! - Field key: `SHA-256(token)`, protects secret fields of each account.
//! - Master key: `SHA-256(token || MASTER_KEY_CONTEXT)`, protects the backup blob.
//!
//! Both are reproducible on any device logged in with the same token. With
//! no token configured the master key falls back to a random value persisted
//! on this device; backups made with it restore only here, which is why the
//! source is carried on [`MasterKey`] and reported to callers.

use crate::storage::{keys, KeyValueStore};
use crate::{Result, VaultError};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use tracing::warn;
use zeroize::ZeroizeOnDrop;

/// Context string appended to the token before hashing the master key.
pub const MASTER_KEY_CONTEXT: &str = "gistvault/backup-master-key/v1";

/// A 256-bit symmetric key, zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct CipherKey {
    key: [u8; 32],
}

impl CipherKey {
    /// Create a key from raw bytes
    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Generate a new random key
    pub fn random() -> Self {
        Self { key: rand::random() }
    }

    /// Get a reference to the key bytes (use sparingly)
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CipherKey(..)")
    }
}

/// Where the master key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasterKeySource {
    /// Derived from the access token; backups restore on any device with that token.
    TokenDerived,
    /// Random and stored on this device only; backups cannot be restored elsewhere.
    DeviceLocal,
}

impl MasterKeySource {
    pub fn is_portable(self) -> bool {
        matches!(self, MasterKeySource::TokenDerived)
    }
}

/// Key protecting the whole-vault backup blob.
#[derive(Debug, Clone)]
pub struct MasterKey {
    key: CipherKey,
    source: MasterKeySource,
}

impl MasterKey {
    pub fn new(key: CipherKey, source: MasterKeySource) -> Self {
        Self { key, source }
    }

    pub fn key(&self) -> &CipherKey {
        &self.key
    }

    pub fn source(&self) -> MasterKeySource {
        self.source
    }
}

/// Field key derived from the access token.
pub fn token_key(access_token: &str) -> CipherKey {
    CipherKey::from_bytes(Sha256::digest(access_token.as_bytes()).into())
}

/// Master key derived from the access token.
pub fn master_key_from_token(access_token: &str) -> CipherKey {
    let mut hasher = Sha256::new();
    hasher.update(access_token.as_bytes());
    hasher.update(MASTER_KEY_CONTEXT.as_bytes());
    CipherKey::from_bytes(hasher.finalize().into())
}

/// Load the device-local master key, creating and persisting it on first use.
pub async fn device_master_key(store: &dyn KeyValueStore) -> Result<CipherKey> {
    if let Some(encoded) = store.get(keys::DEVICE_MASTER_KEY).await? {
        let bytes = STANDARD.decode(encoded.trim()).map_err(|e| {
            VaultError::Storage(format!("stored device master key is not base64: {}", e))
        })?;
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            VaultError::Crypto(crate::CryptoError::InvalidKeyLength {
                expected: 32,
                got: bytes.len(),
            })
        })?;
        return Ok(CipherKey::from_bytes(key));
    }

    let key = CipherKey::random();
    store
        .set(keys::DEVICE_MASTER_KEY, &STANDARD.encode(key.as_bytes()))
        .await?;
    warn!("Generated a device-local master key; backups will only restore on this device");
    Ok(key)
}

/// Keys needed by a running vault.
#[derive(Debug, Clone)]
pub struct KeyRing {
    /// Protects per-account secret fields.
    pub field: Arc<CipherKey>,
    /// Protects the backup blob.
    pub master: Arc<MasterKey>,
}

impl KeyRing {
    /// Build the key ring for `access_token`, falling back to the device-local
    /// key for both roles when no token is available.
    pub async fn load(store: &dyn KeyValueStore, access_token: Option<&str>) -> Result<Self> {
        match access_token.map(str::trim).filter(|t| !t.is_empty()) {
            Some(token) => {
                if let TokenHint::Unrecognized = token_format_hint(token) {
                    warn!("Access token has an unfamiliar format; continuing anyway");
                }
                Ok(Self {
                    field: Arc::new(token_key(token)),
                    master: Arc::new(MasterKey::new(
                        master_key_from_token(token),
                        MasterKeySource::TokenDerived,
                    )),
                })
            }
            None => {
                let key = device_master_key(store).await?;
                Ok(Self {
                    field: Arc::new(key.clone()),
                    master: Arc::new(MasterKey::new(key, MasterKeySource::DeviceLocal)),
                })
            }
        }
    }
}

/// Advisory classification of an access token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenHint {
    Classic,
    FineGrained,
    OAuth,
    Unrecognized,
}

/// Guess the token flavour from its prefix. Never used to reject a token.
pub fn token_format_hint(token: &str) -> TokenHint {
    let token = token.trim();
    if token.starts_with("github_pat_") && token.len() >= 40 {
        TokenHint::FineGrained
    } else if token.starts_with("ghp_") && token.len() >= 36 {
        TokenHint::Classic
    } else if token.starts_with("gho_") || token.starts_with("ghu_") {
        TokenHint::OAuth
    } else if token.len() == 40 && token.bytes().all(|b| b.is_ascii_hexdigit()) {
        TokenHint::Classic
    } else {
        TokenHint::Unrecognized
    }
}
