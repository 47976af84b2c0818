//! Default on-disk locations.

use std::path::PathBuf;

const APP_DIR: &str = "GistVault";

/// Platform data directory for the local store.
///
/// - Windows: %LOCALAPPDATA%\GistVault
/// - macOS: ~/Library/Application Support/GistVault
/// - Linux/Other: ~/.local/share/GistVault
pub fn get_data_dir() -> PathBuf {
    let base = dirs::data_local_dir()
        .or_else(dirs::data_dir)
        .or_else(|| dirs::home_dir().map(|h| h.join(".data")))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join(APP_DIR)
}

/// Platform config directory.
pub fn get_config_dir() -> PathBuf {
    let base = dirs::config_dir()
        .or_else(dirs::data_dir)
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join(APP_DIR)
}

/// Default SQLite store path.
pub fn get_default_store_path() -> PathBuf {
    get_data_dir().join("vault.db")
}

/// Default TOML configuration path.
pub fn get_default_config_path() -> PathBuf {
    get_config_dir().join("config.toml")
}
