//! Classification of stored cipher strings.
//!
//! Prefix inspection happens once, here; everything downstream matches on
//! [`CipherPayload`].

use crate::crypto::cipher::{IV_LEN, VERSION_TAG};
use crate::crypto::token::is_short_token;
use crate::crypto::{CryptoError, Result};
use base64::{engine::general_purpose::STANDARD, Engine};

/// Decoded form of a value that may hold encrypted data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CipherPayload {
    /// `v2:<iv>:<ciphertext>` with both parts base64-decoded.
    Inline {
        iv: [u8; IV_LEN],
        ciphertext: Vec<u8>,
    },
    /// Short token pointing at an inline ciphertext in local storage.
    Token(String),
    /// Pre-encryption value without any separator, returned unchanged.
    Legacy(String),
}

impl CipherPayload {
    /// Classify `input`.
    ///
    /// A string with a `:` that is not a well-formed `v2` triple is
    /// rejected as malformed.
    pub fn parse(input: &str) -> Result<Self> {
        let tagged = input
            .strip_prefix(VERSION_TAG)
            .is_some_and(|rest| rest.starts_with(':'));

        if !tagged {
            if is_short_token(input) {
                return Ok(CipherPayload::Token(input.to_string()));
            }
            if !input.contains(':') {
                return Ok(CipherPayload::Legacy(input.to_string()));
            }
        }

        let parts: Vec<&str> = input.split(':').collect();
        if parts.len() != 3 {
            return Err(CryptoError::MalformedCiphertext(format!(
                "expected 3 ':'-separated parts, found {} (input starts with {:?})",
                parts.len(),
                crate::preview(input, 20)
            )));
        }
        if parts[0] != VERSION_TAG {
            return Err(CryptoError::MalformedCiphertext(format!(
                "unsupported version tag {:?}",
                crate::preview(parts[0], 20)
            )));
        }

        let iv_bytes = STANDARD
            .decode(parts[1])
            .map_err(|e| CryptoError::MalformedCiphertext(format!("invalid IV encoding: {}", e)))?;
        let iv: [u8; IV_LEN] = iv_bytes.as_slice().try_into().map_err(|_| {
            CryptoError::MalformedCiphertext(format!(
                "IV must be {} bytes, got {}",
                IV_LEN,
                iv_bytes.len()
            ))
        })?;

        let ciphertext = STANDARD.decode(parts[2]).map_err(|e| {
            CryptoError::MalformedCiphertext(format!("invalid ciphertext encoding: {}", e))
        })?;

        Ok(CipherPayload::Inline { iv, ciphertext })
    }

    pub fn is_inline(&self) -> bool {
        matches!(self, CipherPayload::Inline { .. })
    }
}
