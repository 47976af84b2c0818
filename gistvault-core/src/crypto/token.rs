//! Short-token indirection for ciphertexts.
//!
//! `token = first 16 chars of base64url(SHA-256(cipher))`. The inline
//! ciphertext is stored once under `cipher_<token>`, so the token acts as a
//! content address. Collisions are not handled: 96 bits of digest is far
//! beyond the number of values a single vault holds.

use crate::crypto::{CipherPayload, CryptoError};
use crate::storage::{keys, KeyValueStore};
use crate::Result;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use sha2::{Digest, Sha256};

/// Length of a short token in characters.
pub const SHORT_TOKEN_LEN: usize = 16;

/// Compute the short token for an inline cipher string.
pub fn short_token(cipher: &str) -> String {
    let digest = Sha256::digest(cipher.as_bytes());
    let mut encoded = URL_SAFE_NO_PAD.encode(digest);
    encoded.truncate(SHORT_TOKEN_LEN);
    encoded
}

/// True if `value` has the exact shape of a short token.
pub fn is_short_token(value: &str) -> bool {
    value.len() == SHORT_TOKEN_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Storage key holding the inline cipher for `token`.
pub fn cache_key(token: &str) -> String {
    format!("{}{}", keys::CIPHER_PREFIX, token)
}

/// Store an inline cipher under its token and return the token.
pub async fn store_cipher(store: &dyn KeyValueStore, cipher: &str) -> Result<String> {
    if !CipherPayload::parse(cipher)?.is_inline() {
        return Err(CryptoError::MalformedCiphertext(
            "only inline v2 ciphertexts can be stored behind a token".to_string(),
        )
        .into());
    }

    let token = short_token(cipher);
    store.set(&cache_key(&token), cipher).await?;
    Ok(token)
}

/// Look up the inline cipher for `token`.
pub async fn resolve_token(store: &dyn KeyValueStore, token: &str) -> Result<String> {
    store
        .get(&cache_key(token))
        .await?
        .ok_or_else(|| CryptoError::TokenNotFound(token.to_string()).into())
}
