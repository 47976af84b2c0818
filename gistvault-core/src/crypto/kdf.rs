//! Argon2id hashing for the app PIN.
//!
//! A PIN has very little entropy, so it is never used as key material; it
//! is only hashed with a per-credential random salt and compared. The cost
//! parameters are stored next to the hash so a later configuration change
//! does not invalidate existing PINs.

use crate::crypto::{CryptoError, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

/// Salt length in bytes
pub const SALT_LEN: usize = 16;

/// Hash output length in bytes
pub const HASH_LEN: usize = 32;

/// Parameters for Argon2id PIN hashing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PinKdfParams {
    /// Memory cost in KiB
    pub mem_cost: u32,

    /// Time cost (number of iterations)
    pub time_cost: u32,

    /// Parallelism (number of lanes)
    pub parallelism: u32,
}

impl Default for PinKdfParams {
    fn default() -> Self {
        Self {
            mem_cost: 19_456, // 19 MiB
            time_cost: 2,
            parallelism: 1,
        }
    }
}

impl PinKdfParams {
    /// Verify that parameters are within the ranges Argon2 accepts
    pub fn validate(&self) -> Result<()> {
        if self.parallelism < 1 {
            return Err(CryptoError::KdfFailed(
                "Parallelism too low (minimum: 1)".to_string(),
            ));
        }
        if self.time_cost < 1 {
            return Err(CryptoError::KdfFailed(
                "Time cost too low (minimum: 1)".to_string(),
            ));
        }
        if self.mem_cost < 8 * self.parallelism {
            return Err(CryptoError::KdfFailed(format!(
                "Memory cost too low (minimum: {} KiB)",
                8 * self.parallelism
            )));
        }
        Ok(())
    }
}

/// Stored PIN verifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinCredential {
    /// Base64 Argon2id output
    pub hash: String,
    /// Base64 random salt
    pub salt: String,
    #[serde(default)]
    pub params: PinKdfParams,
}

impl PinCredential {
    /// Hash `pin` under a freshly generated salt.
    pub fn create(pin: &str, params: PinKdfParams) -> Result<Self> {
        let salt: [u8; SALT_LEN] = rand::random();
        let hash = hash_pin(pin, &salt, &params)?;
        Ok(Self {
            hash: STANDARD.encode(hash),
            salt: STANDARD.encode(salt),
            params,
        })
    }
}

/// Derive the Argon2id hash of a PIN.
pub fn hash_pin(pin: &str, salt: &[u8], params: &PinKdfParams) -> Result<[u8; HASH_LEN]> {
    params.validate()?;

    let params_obj = Params::new(
        params.mem_cost,
        params.time_cost,
        params.parallelism,
        Some(HASH_LEN),
    )
    .map_err(|e| CryptoError::KdfFailed(format!("Invalid parameters: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params_obj);

    let mut out = [0u8; HASH_LEN];
    argon2
        .hash_password_into(pin.as_bytes(), salt, &mut out)
        .map_err(|e| CryptoError::KdfFailed(format!("Hashing failed: {}", e)))?;
    Ok(out)
}

/// Check `candidate` against a stored credential.
///
/// The final comparison is constant-time; the surrounding code (decoding,
/// early returns on corrupt credentials) is not, so timing hardening is best
/// effort only.
pub fn verify_pin(candidate: &str, credential: &PinCredential) -> Result<bool> {
    let salt = STANDARD
        .decode(&credential.salt)
        .map_err(|e| CryptoError::KdfFailed(format!("Stored salt is not base64: {}", e)))?;
    let expected = STANDARD
        .decode(&credential.hash)
        .map_err(|e| CryptoError::KdfFailed(format!("Stored hash is not base64: {}", e)))?;

    let derived = hash_pin(candidate, &salt, &credential.params)?;
    Ok(derived.as_slice().ct_eq(expected.as_slice()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> PinKdfParams {
        PinKdfParams {
            mem_cost: 64,
            time_cost: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn test_params_validation() {
        assert!(PinKdfParams::default().validate().is_ok());

        let mut params = fast();
        params.time_cost = 0;
        assert!(params.validate().is_err());

        let mut params = fast();
        params.parallelism = 4;
        params.mem_cost = 16;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_verify_pin() {
        let credential = PinCredential::create("135790", fast()).unwrap();

        assert!(verify_pin("135790", &credential).unwrap());
        assert!(!verify_pin("111111", &credential).unwrap());
    }

    #[test]
    fn test_fresh_salt_per_credential() {
        let a = PinCredential::create("1234", fast()).unwrap();
        let b = PinCredential::create("1234", fast()).unwrap();

        assert_ne!(a.salt, b.salt);
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn test_hash_is_deterministic_for_salt() {
        let salt = [5u8; SALT_LEN];
        let h1 = hash_pin("2468", &salt, &fast()).unwrap();
        let h2 = hash_pin("2468", &salt, &fast()).unwrap();
        assert_eq!(h1, h2);
        assert_ne!(h1, hash_pin("2469", &salt, &fast()).unwrap());
    }
}
