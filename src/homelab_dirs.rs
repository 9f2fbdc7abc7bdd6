//! Centralized filesystem paths for the homelab core.
//!
//! Uses the [`dirs`] crate for platform-appropriate directory resolution.
//!
//! # Directory Layout
//!
//! | Purpose | macOS | Linux |
//! |---------|-------|-------|
//! | Data | `~/Library/Application Support/homelab/` | `~/.local/share/homelab/` |
//! | Config | `~/Library/Application Support/homelab/` | `~/.config/homelab/` |
//!
//! # Environment Overrides
//!
//! - `HOMELAB_DATA_DIR` overrides [`data_dir`]
//! - `HOMELAB_CONFIG_DIR` overrides [`config_dir`]

use std::path::PathBuf;

/// Application data root directory.
///
/// Holds the header snapshot cache, config backups, and logs.
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("HOMELAB_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join("homelab"))
        .unwrap_or_else(|| PathBuf::from("/tmp/homelab-data"))
}

/// Application config directory.
///
/// Holds `config.toml` (orchestrator tuning) and `settings.json` (user
/// settings, including the scheduled task list).
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("HOMELAB_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("homelab"))
        .unwrap_or_else(|| PathBuf::from("/tmp/homelab-config"))
}

/// Log file directory (`data_dir()/logs/`).
#[must_use]
pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Config backup directory (`data_dir()/backups/`).
#[must_use]
pub fn backups_dir() -> PathBuf {
    data_dir().join("backups")
}

/// Orchestrator config file path (`config_dir()/config.toml`).
#[must_use]
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// User settings store path (`config_dir()/settings.json`).
#[must_use]
pub fn settings_file() -> PathBuf {
    config_dir().join("settings.json")
}

/// Header snapshot cache path (`data_dir()/header_cache.json`).
#[must_use]
pub fn header_cache_file() -> PathBuf {
    data_dir().join("header_cache.json")
}
