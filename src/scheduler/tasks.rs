//! Scheduled task definitions.
//!
//! Defines the persisted [`ScheduledTask`] record, the closed set of
//! [`TaskKind`]s, and the run-history types.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Interval presets offered when adding or editing a task, in seconds.
pub const INTERVAL_PRESETS: &[(&str, u64)] = &[
    ("Every 15 minutes", 900),
    ("Every 30 minutes", 1_800),
    ("Every hour", 3_600),
    ("Every 6 hours", 21_600),
    ("Every 12 hours", 43_200),
    ("Every 24 hours", 86_400),
];

/// Default interval for tasks persisted without one.
const DEFAULT_INTERVAL_SECS: u64 = 3_600;

/// What a scheduled task does. Each kind maps to one registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Probe network reachability (legacy name `speedtest`).
    #[serde(alias = "speedtest")]
    ConnectivityTest,
    /// Check running containers for image updates.
    #[serde(alias = "container_updates")]
    UpdateCheck,
    /// Run the consolidated health check.
    HealthCheck,
    /// Write a timestamped export of the settings store.
    #[serde(alias = "backup_config")]
    ConfigBackup,
}

impl TaskKind {
    /// Every kind, in menu order.
    pub const ALL: [TaskKind; 4] = [
        Self::ConnectivityTest,
        Self::UpdateCheck,
        Self::HealthCheck,
        Self::ConfigBackup,
    ];

    /// Human-readable label.
    pub fn label(self) -> &'static str {
        match self {
            Self::ConnectivityTest => "Run connectivity test",
            Self::UpdateCheck => "Check container updates",
            Self::HealthCheck => "Run health check",
            Self::ConfigBackup => "Backup config file",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A recurring task persisted in the settings store.
///
/// Field names on disk (`type`, `interval`) match the historical settings
/// layout so existing task lists keep loading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTask {
    /// Unique task identifier (uuid v4). Assigned on load when missing.
    #[serde(default = "new_task_id")]
    pub id: String,
    /// Which handler runs this task.
    #[serde(rename = "type")]
    pub kind: TaskKind,
    /// Minimum seconds between runs.
    #[serde(rename = "interval", default = "default_interval")]
    pub interval_secs: u64,
    /// Disabled tasks are never due.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Timestamp of the last run, success or failure.
    #[serde(default, deserialize_with = "blank_as_none")]
    pub last_run: Option<String>,
    /// Number of completed runs.
    #[serde(default)]
    pub run_count: u64,
}

fn new_task_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_SECS
}

fn default_enabled() -> bool {
    true
}

fn blank_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.filter(|s| !s.trim().is_empty()))
}

impl ScheduledTask {
    /// Create a new enabled task that has never run.
    pub fn new(kind: TaskKind, interval_secs: u64) -> Self {
        Self {
            id: new_task_id(),
            kind,
            interval_secs,
            enabled: true,
            last_run: None,
            run_count: 0,
        }
    }

    /// Parsed `last_run`, if present and well-formed.
    ///
    /// Accepts RFC 3339 and offset-less ISO 8601 timestamps. The latter are
    /// read as local time.
    pub fn last_run_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.last_run.as_deref()?.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
        Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Returns `true` if the task is enabled and due at `now`.
    ///
    /// A missing or unparseable `last_run` is always due.
    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        match self.last_run_at() {
            None => true,
            Some(last) => {
                let elapsed = now.signed_duration_since(last).num_seconds();
                elapsed >= 0 && elapsed.unsigned_abs() >= self.interval_secs
            }
        }
    }

    /// Returns `true` if the task is due now.
    pub fn is_due(&self) -> bool {
        self.is_due_at(Utc::now())
    }

    /// Record a run that finished at `at`, whatever its outcome.
    pub fn mark_run(&mut self, at: DateTime<Utc>) {
        self.last_run = Some(at.with_timezone(&Local).to_rfc3339());
        self.run_count += 1;
    }
}

/// Render an interval as `15m`, `6h`, or `1d`.
pub fn format_interval(secs: u64) -> String {
    if secs < 3_600 {
        format!("{}m", secs / 60)
    } else if secs < 86_400 {
        format!("{}h", secs / 3_600)
    } else {
        format!("{}d", secs / 86_400)
    }
}

/// How a task run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRunOutcome {
    Success,
    Failed,
}

/// One entry of the scheduler run history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRunRecord {
    pub task_id: String,
    pub kind: TaskKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: TaskRunOutcome,
    /// Handler summary, or the error message on failure.
    pub summary: String,
}

/// The task currently executing, as reported by
/// [`Scheduler::running_task`](super::Scheduler::running_task).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningTask {
    pub task_id: String,
    pub kind: TaskKind,
    pub started_at: DateTime<Utc>,
}
