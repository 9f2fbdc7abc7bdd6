//! Configuration types for the orchestration core.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Status aggregator timeouts and pool sizing.
    pub aggregator: AggregatorConfig,
    /// Task scheduler cadence and history.
    pub scheduler: SchedulerConfig,
    /// Transfer queue worker settings.
    pub transfers: TransferConfig,
    /// Notification delivery settings.
    pub notifications: NotificationConfig,
}

/// Status aggregator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Per-collector timeout in milliseconds.
    pub collector_timeout_ms: u64,
    /// Whole-refresh timeout in milliseconds.
    pub total_timeout_ms: u64,
    /// Lower bound on the per-refresh worker pool size.
    pub min_workers: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            collector_timeout_ms: 8_000,
            total_timeout_ms: 15_000,
            min_workers: 4,
        }
    }
}

impl AggregatorConfig {
    /// Per-collector timeout.
    pub fn collector_timeout(&self) -> Duration {
        Duration::from_millis(self.collector_timeout_ms)
    }

    /// Time a built-in collector may spend on its own checks: four fifths of
    /// the collector timeout, leaving room to assemble the result.
    pub fn check_budget(&self) -> Duration {
        self.collector_timeout() * 4 / 5
    }

    /// Whole-refresh timeout.
    pub fn total_timeout(&self) -> Duration {
        Duration::from_millis(self.total_timeout_ms)
    }

    /// Worker pool size for a refresh over `plugin_count` configured plugins.
    ///
    /// The two extra slots are for the health and connectivity collectors.
    pub fn pool_size(&self, plugin_count: usize) -> usize {
        (plugin_count + 2).max(self.min_workers).max(1)
    }
}

/// Task scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between scheduler ticks.
    pub tick_interval_secs: u64,
    /// Number of run-history entries kept in memory.
    pub history_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            history_limit: 200,
        }
    }
}

impl SchedulerConfig {
    /// Tick cadence.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

/// Transfer queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// How long an idle worker sleeps before re-checking the queue, in ms.
    pub idle_poll_ms: u64,
    /// Maximum completed jobs kept for display.
    pub history_limit: usize,
    /// Report transfers as successful without running them.
    pub dry_run: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            idle_poll_ms: 5_000,
            history_limit: 50,
            dry_run: false,
        }
    }
}

impl TransferConfig {
    /// Idle poll interval.
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

/// Notification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Master switch for all notifications.
    pub enabled: bool,
    /// Discord webhook URL (empty = disabled).
    pub discord_webhook_url: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            discord_webhook_url: String::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| {
            crate::error::OrchestratorError::Config(format!(
                "cannot parse {}: {e}",
                path.display()
            ))
        })
    }

    /// Load configuration from `path`, falling back to defaults when the file
    /// does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default(path: &std::path::Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::from_file(path)
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| crate::error::OrchestratorError::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Default config path (`config_dir()/config.toml`).
    pub fn default_config_path() -> PathBuf {
        crate::homelab_dirs::config_file()
    }
}
