//! AES-256-CBC encryption for vault fields and backup blobs.
//!
//! Wire format: `v2:<base64 iv>:<base64 ciphertext>` with:
//! - 256-bit key
//! - 128-bit random IV, fresh for every call
//! - PKCS#7 padding
//!
//! CBC carries no authentication tag. A wrong key shows up as a padding
//! failure, invalid UTF-8 or an empty plaintext, all reported as
//! [`CryptoError::WrongKey`].

use crate::crypto::{CipherKey, CryptoError, Result};
use aes::Aes256;
use base64::{engine::general_purpose::STANDARD, Engine};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Version tag leading every inline ciphertext.
pub const VERSION_TAG: &str = "v2";

/// IV length in bytes.
pub const IV_LEN: usize = 16;

const BLOCK_LEN: usize = 16;

/// Encrypt a string into the `v2` wire format.
///
/// Every call draws a new IV, so encrypting the same plaintext twice yields
/// two different strings.
pub fn encrypt_string(key: &CipherKey, plaintext: &str) -> Result<String> {
    if plaintext.is_empty() {
        return Err(CryptoError::EmptyInput);
    }

    let iv: [u8; IV_LEN] = rand::random();
    let ciphertext = Aes256CbcEnc::new(key.as_bytes().into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    Ok(format!(
        "{}:{}:{}",
        VERSION_TAG,
        STANDARD.encode(iv),
        STANDARD.encode(ciphertext)
    ))
}

/// Decrypt raw IV and ciphertext bytes produced by [`encrypt_string`].
pub fn decrypt_inline(key: &CipherKey, iv: &[u8; IV_LEN], ciphertext: &[u8]) -> Result<String> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
        return Err(CryptoError::MalformedCiphertext(format!(
            "ciphertext length {} is not a positive multiple of {}",
            ciphertext.len(),
            BLOCK_LEN
        )));
    }

    let plaintext = Aes256CbcDec::new(key.as_bytes().into(), &(*iv).into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::WrongKey)?;

    if plaintext.is_empty() {
        return Err(CryptoError::WrongKey);
    }

    String::from_utf8(plaintext).map_err(|_| CryptoError::WrongKey)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CipherPayload;

    fn roundtrip(key: &CipherKey, cipher: &str) -> Result<String> {
        match CipherPayload::parse(cipher)? {
            CipherPayload::Inline { iv, ciphertext } => decrypt_inline(key, &iv, &ciphertext),
            other => panic!("expected inline payload, got {:?}", other),
        }
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = CipherKey::from_bytes([0x42; 32]);
        let long = "x".repeat(1000);
        for plaintext in [
            "a",
            "exactly sixteen!",
            "Hello, World! ünïcödé 🔐",
            long.as_str(),
        ] {
            let cipher = encrypt_string(&key, plaintext).unwrap();
            assert!(cipher.starts_with("v2:"));
            assert_eq!(roundtrip(&key, &cipher).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_fresh_iv_per_call() {
        let key = CipherKey::from_bytes([9; 32]);
        let first = encrypt_string(&key, "Same data").unwrap();
        let second = encrypt_string(&key, "Same data").unwrap();

        assert_ne!(first, second);
        assert_eq!(roundtrip(&key, &first).unwrap(), "Same data");
        assert_eq!(roundtrip(&key, &second).unwrap(), "Same data");
    }

    #[test]
    fn test_empty_input_rejected() {
        let key = CipherKey::from_bytes([1; 32]);
        assert_eq!(encrypt_string(&key, ""), Err(CryptoError::EmptyInput));
    }

    #[test]
    fn test_wrong_key_fails() {
        let k1 = CipherKey::from_bytes([1; 32]);
        let k2 = CipherKey::from_bytes([2; 32]);
        let cipher = encrypt_string(&k1, "Secret data that spans blocks").unwrap();
        assert_eq!(roundtrip(&k2, &cipher), Err(CryptoError::WrongKey));
    }

    #[test]
    fn test_truncated_ciphertext_is_malformed() {
        let key = CipherKey::from_bytes([1; 32]);
        let iv = [0u8; IV_LEN];
        assert!(matches!(
            decrypt_inline(&key, &iv, &[1, 2, 3]),
            Err(CryptoError::MalformedCiphertext(_))
        ));
    }
}
