//! Cryptographic primitives for the vault.
//!
//! This module provides:
//! - Key derivation from the access token (field key and master key)
//! - Versioned AES-256-CBC encryption with the `v2:<iv>:<ct>` wire format
//! - Short-token indirection for large ciphertexts
//! - Argon2id PIN hashing

pub mod cipher;
pub mod kdf;
pub mod keyring;
pub mod payload;
pub mod token;

pub use cipher::{decrypt_inline, encrypt_string, VERSION_TAG};
pub use kdf::{hash_pin, verify_pin, PinCredential, PinKdfParams};
pub use keyring::{CipherKey, KeyRing, MasterKey, MasterKeySource};
pub use payload::CipherPayload;
pub use token::{resolve_token, short_token, store_cipher};

use crate::storage::KeyValueStore;
use thiserror::Error;

/// Errors that can occur in cryptographic operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Cannot encrypt empty input")]
    EmptyInput,

    #[error("Malformed ciphertext: {0}")]
    MalformedCiphertext(String),

    #[error("Decryption produced no data; the key is probably wrong")]
    WrongKey,

    #[error("Cipher token '{0}' is not present in local storage")]
    TokenNotFound(String),

    #[error("Key derivation failed: {0}")]
    KdfFailed(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
}

/// Result type for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Decrypt any stored cipher reference: inline `v2` ciphertext, short token
/// or legacy plaintext.
///
/// Short tokens are resolved through `store`; a token that cannot be
/// resolved fails with [`CryptoError::TokenNotFound`] rather than being
/// treated as plaintext.
pub async fn decrypt(
    store: &dyn KeyValueStore,
    key: &CipherKey,
    input: &str,
) -> crate::Result<String> {
    match CipherPayload::parse(input)? {
        CipherPayload::Legacy(text) => Ok(text),
        CipherPayload::Inline { iv, ciphertext } => Ok(decrypt_inline(key, &iv, &ciphertext)?),
        CipherPayload::Token(token) => {
            let inline = resolve_token(store, &token).await?;
            match CipherPayload::parse(&inline)? {
                CipherPayload::Inline { iv, ciphertext } => {
                    Ok(decrypt_inline(key, &iv, &ciphertext)?)
                }
                _ => Err(CryptoError::MalformedCiphertext(format!(
                    "token '{}' does not point at an inline ciphertext",
                    token
                ))
                .into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::VaultError;

    fn key(byte: u8) -> CipherKey {
        CipherKey::from_bytes([byte; 32])
    }

    #[tokio::test]
    async fn test_decrypt_inline_roundtrip() {
        let store = MemoryStore::new();
        let k = key(7);
        let cipher = encrypt_string(&k, "hunter2").unwrap();
        assert_eq!(decrypt(&store, &k, &cipher).await.unwrap(), "hunter2");
    }

    #[tokio::test]
    async fn test_legacy_plaintext_passes_through() {
        let store = MemoryStore::new();
        let out = decrypt(&store, &key(1), "not-encrypted-text").await.unwrap();
        assert_eq!(out, "not-encrypted-text");
    }

    #[tokio::test]
    async fn test_token_resolves_to_exact_inline_cipher() {
        let store = MemoryStore::new();
        let k = key(3);
        let cipher = encrypt_string(&k, "otpauth://totp/x?secret=JBSWY3DPEHPK3PXP").unwrap();

        let token = store_cipher(&store, &cipher).await.unwrap();
        assert_eq!(resolve_token(&store, &token).await.unwrap(), cipher);
        assert_eq!(
            decrypt(&store, &k, &token).await.unwrap(),
            "otpauth://totp/x?secret=JBSWY3DPEHPK3PXP"
        );
    }

    #[tokio::test]
    async fn test_missing_token_fails_closed() {
        let store = MemoryStore::new();
        let k = key(3);
        let cipher = encrypt_string(&k, "secret").unwrap();
        let token = short_token(&cipher);

        let err = decrypt(&store, &k, &token).await.unwrap_err();
        assert!(matches!(
            err,
            VaultError::Crypto(CryptoError::TokenNotFound(ref t)) if *t == token
        ));
    }

    #[tokio::test]
    async fn test_wrong_key_is_reported() {
        let store = MemoryStore::new();
        let cipher = encrypt_string(&key(1), "correct horse battery staple").unwrap();
        let err = decrypt(&store, &key(2), &cipher).await.unwrap_err();
        assert!(matches!(err, VaultError::Crypto(CryptoError::WrongKey)));
    }
}
