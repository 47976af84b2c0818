//! Vault configuration loaded from TOML.

use crate::accounts::DEFAULT_TOKEN_THRESHOLD;
use crate::crypto::PinKdfParams;
use crate::lockout::LockoutConfig;
use crate::sync::SyncSettings;
use crate::{Result, VaultError};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub sync: SyncSettings,
    pub lockout: LockoutConfig,
    pub pin_kdf: PinKdfParams,
    /// Field ciphertexts longer than this are stored behind a short token.
    pub token_threshold: usize,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            sync: SyncSettings::default(),
            lockout: LockoutConfig::default(),
            pin_kdf: PinKdfParams::default(),
            token_threshold: DEFAULT_TOKEN_THRESHOLD,
        }
    }
}

impl VaultConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| VaultError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Load `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| VaultError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.pin_kdf
            .validate()
            .map_err(|e| VaultError::Config(e.to_string()))?;
        if self.lockout.max_attempts == 0 {
            return Err(VaultError::Config(
                "lockout.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.sync.backup_filename.trim().is_empty() {
            return Err(VaultError::Config(
                "sync.backup_filename cannot be empty".to_string(),
            ));
        }
        if self.sync.poll_interval_secs == 0 {
            return Err(VaultError::Config(
                "sync.poll_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.sync.page_size == 0 || self.sync.page_size > 100 {
            return Err(VaultError::Config(
                "sync.page_size must be between 1 and 100".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = VaultConfig::default();
        assert_eq!(config.sync.api_base_url, "https://api.github.com");
        assert_eq!(config.sync.backup_filename, "gistvault-backup.txt");
        assert_eq!(config.sync.debounce_ms, 3000);
        assert_eq!(config.sync.poll_interval_secs, 60);
        assert_eq!(config.sync.history_limit, 20);
        assert_eq!(config.lockout.max_attempts, 5);
        assert_eq!(config.pin_kdf.mem_cost, 19_456);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = VaultConfig::from_toml(
            r#"
            token_threshold = 128

            [sync]
            debounce_ms = 500

            [lockout]
            lockout_seconds = 60
            "#,
        )
        .unwrap();

        assert_eq!(config.token_threshold, 128);
        assert_eq!(config.sync.debounce_ms, 500);
        assert_eq!(config.sync.poll_interval_secs, 60);
        assert_eq!(config.lockout.lockout_seconds, 60);
        assert_eq!(config.lockout.max_attempts, 5);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(VaultConfig::from_toml("[sync]\npoll_interval_secs = 0").is_err());
        assert!(VaultConfig::from_toml("[lockout]\nmax_attempts = 0").is_err());
        assert!(VaultConfig::from_toml("[pin_kdf]\ntime_cost = 0").is_err());
        assert!(VaultConfig::from_toml("not = [valid").is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = VaultConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, VaultConfig::default());
    }
}
