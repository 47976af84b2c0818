//! Backup codec: the whole vault as one master-key ciphertext.
//!
//! The plaintext is a JSON [`BackupDocument`]. Two outer encodings are
//! accepted on import: the bare `v2:` ciphertext written today, and the
//! older `{"cipher": "v2:..."}` wrapper.

use crate::accounts::{AccountRecord, AccountStore};
use crate::crypto::{
    decrypt_inline, encrypt_string, CipherKey, CipherPayload, CryptoError, VERSION_TAG,
};
use crate::{preview, Result, VaultError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

const PREVIEW_LEN: usize = 20;

/// Decrypted backup contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupDocument {
    #[serde(default)]
    pub exported_at: Option<DateTime<Utc>>,
    /// Account records keyed by their local storage key. Absent means the
    /// document is invalid; empty means the vault had no accounts.
    #[serde(default)]
    pub accounts: Option<BTreeMap<String, AccountRecord>>,
    /// Index order at export time. Older backups omit it.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order: Vec<String>,
}

impl BackupDocument {
    pub fn account_count(&self) -> usize {
        self.accounts.as_ref().map_or(0, BTreeMap::len)
    }
}

/// Result of [`export`].
#[derive(Debug, Clone)]
pub struct ExportedBackup {
    /// `v2:` ciphertext of the serialized document.
    pub blob: String,
    pub account_count: usize,
    /// Keys of records that could not be read and were left out.
    pub skipped: Vec<String>,
}

/// Legacy outer wrapper.
#[derive(Deserialize)]
struct LegacyWrapper {
    cipher: Option<String>,
}

/// Collect every indexed account into a document.
///
/// A record that cannot be read, or whose token references cannot be
/// resolved, is skipped with a warning instead of failing the export.
pub async fn collect(accounts: &AccountStore) -> Result<(BackupDocument, Vec<String>)> {
    let mut records = BTreeMap::new();
    let mut order = Vec::new();
    let mut skipped = Vec::new();

    for key in accounts.index().await? {
        let record = match accounts.get(&key).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(key = %key, "Skipping indexed account with no record");
                skipped.push(key);
                continue;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Skipping unreadable account");
                skipped.push(key);
                continue;
            }
        };

        match accounts.inline_refs(&record).await {
            Ok(portable) => {
                order.push(key.clone());
                records.insert(key, portable);
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Skipping account with unresolvable cipher");
                skipped.push(key);
            }
        }
    }

    let document = BackupDocument {
        exported_at: Some(Utc::now()),
        accounts: Some(records),
        order,
    };
    Ok((document, skipped))
}

/// Serialize and encrypt a document with the master key.
pub fn seal(document: &BackupDocument, master: &CipherKey) -> Result<String> {
    let json = serde_json::to_string(document)?;
    Ok(encrypt_string(master, &json)?)
}

/// Export the whole vault as one ciphertext.
pub async fn export(accounts: &AccountStore, master: &CipherKey) -> Result<ExportedBackup> {
    let (document, skipped) = collect(accounts).await?;
    let blob = seal(&document, master)?;
    Ok(ExportedBackup {
        blob,
        account_count: document.account_count(),
        skipped,
    })
}

/// Strip the outer encoding and return the inline `v2:` ciphertext.
pub fn decode_backup_text(text: &str) -> Result<String> {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        let wrapper: LegacyWrapper =
            serde_json::from_str(trimmed).map_err(|_| unrecognized(trimmed))?;
        return match wrapper.cipher {
            Some(cipher) if cipher.trim().starts_with(VERSION_TAG) => {
                Ok(cipher.trim().to_string())
            }
            _ => Err(unrecognized(trimmed)),
        };
    }

    if trimmed.starts_with(&format!("{}:", VERSION_TAG)) {
        return Ok(trimmed.to_string());
    }

    Err(unrecognized(trimmed))
}

/// Decode, decrypt and parse a backup body.
pub fn open(text: &str, master: &CipherKey) -> Result<BackupDocument> {
    let cipher = decode_backup_text(text)?;
    let json = match CipherPayload::parse(&cipher)? {
        CipherPayload::Inline { iv, ciphertext } => decrypt_inline(master, &iv, &ciphertext)?,
        _ => {
            return Err(CryptoError::MalformedCiphertext(format!(
                "backup body is not an inline ciphertext ({:?})",
                preview(&cipher, PREVIEW_LEN)
            ))
            .into())
        }
    };

    let document: BackupDocument = serde_json::from_str(&json)
        .map_err(|e| VaultError::Serialization(format!("backup document is invalid: {}", e)))?;
    if document.accounts.is_none() {
        return Err(VaultError::Serialization(
            "backup document has no accounts field".to_string(),
        ));
    }
    Ok(document)
}

/// Replace the local vault with the contents of a backup body.
///
/// Destructive: local accounts missing from the backup are deleted.
pub async fn import(accounts: &AccountStore, master: &CipherKey, text: &str) -> Result<usize> {
    let document = open(text, master)?;
    let records = document.accounts.unwrap_or_default();
    let count = accounts.replace_all(&document.order, &records).await?;
    info!(accounts = count, "Imported backup");
    Ok(count)
}

fn unrecognized(input: &str) -> VaultError {
    VaultError::UnrecognizedFormat {
        preview: preview(input, PREVIEW_LEN),
    }
}
