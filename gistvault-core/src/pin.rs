//! PIN gate: decides whether the rest of the vault is reachable.
//!
//! States and transitions:
//! - `NoPin --setup_pin--> Unlocked`
//! - `Unlocked --app_background--> Locked` (only with a PIN configured)
//! - `Locked --verify(correct)--> Unlocked`, counter reset
//! - `Locked|Unlocked --verify(wrong)--> Locked`, counter incremented; at
//!   the threshold `LockedOut(now + lockout)`
//! - `LockedOut --time elapses--> Locked`, counter reset
//! - `Locked|LockedOut --remove_pin(correct)--> NoPin`
//!
//! While locked out, verification is refused before any hashing happens and
//! does not consume an attempt. Removing the PIN still checks it, but a
//! wrong PIN during lockout is not counted either.

use crate::crypto::kdf::{verify_pin, PinCredential, PinKdfParams};
use crate::lockout::{LockoutConfig, LockoutTracker};
use crate::storage::{keys, KeyValueStore};
use crate::{Result, VaultError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

/// Minimum PIN length
pub const MIN_PIN_LEN: usize = 4;
/// Maximum PIN length
pub const MAX_PIN_LEN: usize = 12;

/// Observable gate state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinState {
    NoPin,
    Unlocked,
    Locked,
    LockedOut { until: DateTime<Utc> },
}

/// Result of a verification attempt that reached the hash comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Unlocked,
    Rejected {
        attempts_remaining: u32,
        locked_out_until: Option<DateTime<Utc>>,
    },
}

impl VerifyOutcome {
    pub fn is_unlocked(&self) -> bool {
        matches!(self, VerifyOutcome::Unlocked)
    }
}

pub struct PinGate {
    store: Arc<dyn KeyValueStore>,
    kdf: PinKdfParams,
    credential: Option<PinCredential>,
    locked: bool,
    lockout: LockoutTracker,
}

impl PinGate {
    /// Load the stored credential. A configured PIN starts out locked.
    pub async fn load(
        store: Arc<dyn KeyValueStore>,
        lockout: LockoutConfig,
        kdf: PinKdfParams,
    ) -> Result<Self> {
        let credential = match store.get(keys::PIN_CREDENTIAL).await? {
            Some(raw) => Some(serde_json::from_str::<PinCredential>(&raw).map_err(|e| {
                VaultError::Storage(format!("stored PIN credential is corrupt: {}", e))
            })?),
            None => None,
        };
        let locked = credential.is_some();

        Ok(Self {
            store,
            kdf,
            credential,
            locked,
            lockout: LockoutTracker::new(lockout),
        })
    }

    pub fn has_pin(&self) -> bool {
        self.credential.is_some()
    }

    pub fn state(&mut self) -> PinState {
        self.state_at(Utc::now())
    }

    pub fn state_at(&mut self, now: DateTime<Utc>) -> PinState {
        if self.credential.is_none() {
            return PinState::NoPin;
        }
        if let Some(until) = self.lockout.locked_until(now) {
            return PinState::LockedOut { until };
        }
        if self.locked {
            PinState::Locked
        } else {
            PinState::Unlocked
        }
    }

    pub fn failed_attempts(&self) -> u32 {
        self.lockout.failed_attempts()
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.lockout.attempts_remaining()
    }

    /// Configure the first PIN.
    pub async fn setup_pin(&mut self, pin: &str) -> Result<()> {
        if self.credential.is_some() {
            return Err(VaultError::InvalidInput(
                "A PIN is already configured; change it instead".to_string(),
            ));
        }
        validate_pin(pin)?;

        let credential = PinCredential::create(pin, self.kdf)?;
        self.persist(&credential).await?;
        self.credential = Some(credential);
        self.locked = false;
        self.lockout.clear();

        info!("PIN configured");
        Ok(())
    }

    /// Host app left the foreground.
    pub fn app_background(&mut self) {
        if self.credential.is_some() && !self.locked {
            self.locked = true;
            info!("Vault locked");
        }
    }

    pub fn verify(&mut self, pin: &str) -> Result<VerifyOutcome> {
        self.verify_at(pin, Utc::now())
    }

    pub fn verify_at(&mut self, pin: &str, now: DateTime<Utc>) -> Result<VerifyOutcome> {
        let credential = self.credential.as_ref().ok_or(VaultError::NoPin)?;

        if let Some(until) = self.lockout.locked_until(now) {
            return Err(VaultError::LockedOut { until });
        }

        if verify_pin(pin, credential)? {
            self.lockout.clear();
            if self.locked {
                info!("Vault unlocked");
            }
            self.locked = false;
            return Ok(VerifyOutcome::Unlocked);
        }

        if !self.locked {
            info!("Vault locked after a wrong PIN");
        }
        self.locked = true;
        let record = self.lockout.record_failure(now);
        match record.locked_out_until {
            Some(until) => warn!(%until, "Wrong PIN; locked out"),
            None => warn!(
                attempts_remaining = record.attempts_remaining,
                "Wrong PIN"
            ),
        }
        Ok(VerifyOutcome::Rejected {
            attempts_remaining: record.attempts_remaining,
            locked_out_until: record.locked_out_until,
        })
    }

    /// Replace the PIN. The current PIN is checked like any other attempt.
    pub async fn change_pin(&mut self, current: &str, new_pin: &str) -> Result<VerifyOutcome> {
        self.change_pin_at(current, new_pin, Utc::now()).await
    }

    pub async fn change_pin_at(
        &mut self,
        current: &str,
        new_pin: &str,
        now: DateTime<Utc>,
    ) -> Result<VerifyOutcome> {
        validate_pin(new_pin)?;
        let outcome = self.verify_at(current, now)?;
        if outcome.is_unlocked() {
            let credential = PinCredential::create(new_pin, self.kdf)?;
            self.persist(&credential).await?;
            self.credential = Some(credential);
            info!("PIN changed");
        }
        Ok(outcome)
    }

    /// Remove the PIN. Requires the current PIN, also during a lockout.
    pub async fn remove_pin(&mut self, current: &str) -> Result<VerifyOutcome> {
        self.remove_pin_at(current, Utc::now()).await
    }

    pub async fn remove_pin_at(
        &mut self,
        current: &str,
        now: DateTime<Utc>,
    ) -> Result<VerifyOutcome> {
        let outcome = match self.lockout.locked_until(now) {
            Some(until) => {
                let credential = self.credential.as_ref().ok_or(VaultError::NoPin)?;
                if verify_pin(current, credential)? {
                    VerifyOutcome::Unlocked
                } else {
                    warn!(%until, "Wrong PIN during lockout; PIN kept");
                    VerifyOutcome::Rejected {
                        attempts_remaining: self.lockout.attempts_remaining(),
                        locked_out_until: Some(until),
                    }
                }
            }
            None => self.verify_at(current, now)?,
        };

        if outcome.is_unlocked() {
            self.store.delete(keys::PIN_CREDENTIAL).await?;
            self.credential = None;
            self.locked = false;
            self.lockout.clear();
            info!("PIN removed");
        }
        Ok(outcome)
    }

    async fn persist(&self, credential: &PinCredential) -> Result<()> {
        let raw = serde_json::to_string(credential)?;
        self.store.set(keys::PIN_CREDENTIAL, &raw).await
    }
}

fn validate_pin(pin: &str) -> Result<()> {
    let digits_only = pin.bytes().all(|b| b.is_ascii_digit());
    if !(MIN_PIN_LEN..=MAX_PIN_LEN).contains(&pin.len()) || !digits_only {
        return Err(VaultError::InvalidInput(format!(
            "PIN must be {} to {} digits",
            MIN_PIN_LEN, MAX_PIN_LEN
        )));
    }
    Ok(())
}
