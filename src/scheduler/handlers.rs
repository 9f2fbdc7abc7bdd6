//! Task handlers and the kind-to-handler registry.

use super::tasks::{ScheduledTask, TaskKind};
use crate::collector::Collector;
use crate::error::{OrchestratorError, Result};
use crate::settings::{ConfigStore, write_atomic};
use chrono::Local;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Executes one kind of scheduled task.
///
/// Any `Fn(&ScheduledTask) -> Result<String>` closure is a handler.
pub trait TaskHandler: Send + Sync {
    /// Run the task and return a one-line summary.
    ///
    /// # Errors
    ///
    /// Returns an error when the task failed. The scheduler records it and
    /// still advances the task's bookkeeping.
    fn run(&self, task: &ScheduledTask) -> Result<String>;
}

impl<F> TaskHandler for F
where
    F: Fn(&ScheduledTask) -> Result<String> + Send + Sync,
{
    fn run(&self, task: &ScheduledTask) -> Result<String> {
        self(task)
    }
}

/// Maps each [`TaskKind`] to its handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `kind`.
    pub fn with(mut self, kind: TaskKind, handler: impl TaskHandler + 'static) -> Self {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    pub fn has(&self, kind: TaskKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Dispatch `task` to its handler.
    ///
    /// # Errors
    ///
    /// Returns an error when no handler is registered for the task's kind,
    /// or whatever the handler returns.
    pub fn run(&self, task: &ScheduledTask) -> Result<String> {
        match self.handlers.get(&task.kind) {
            Some(handler) => handler.run(task),
            None => Err(OrchestratorError::Handler(format!(
                "no handler registered for {}",
                task.kind
            ))),
        }
    }
}

/// Writes a timestamped JSON export of the settings store.
pub struct ConfigBackupHandler {
    settings: Arc<dyn ConfigStore>,
    backup_dir: PathBuf,
}

impl ConfigBackupHandler {
    pub fn new(settings: Arc<dyn ConfigStore>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            settings,
            backup_dir: backup_dir.into(),
        }
    }

    /// File name for a backup taken now.
    pub fn backup_file_name() -> String {
        format!("homelabrc_{}.json", Local::now().format("%Y%m%d_%H%M%S"))
    }
}

impl TaskHandler for ConfigBackupHandler {
    fn run(&self, _task: &ScheduledTask) -> Result<String> {
        let path = self.backup_dir.join(Self::backup_file_name());
        let json = serde_json::to_string_pretty(&self.settings.export())?;
        write_atomic(&path, json.as_bytes())?;
        info!(path = %path.display(), "settings backed up");
        Ok(format!("backed up to {}", path.display()))
    }
}

/// Runs a status collector as a scheduled task and summarizes its alerts.
pub struct CollectorTaskHandler {
    collector: Arc<dyn Collector>,
}

impl CollectorTaskHandler {
    pub fn new(collector: Arc<dyn Collector>) -> Self {
        Self { collector }
    }
}

impl TaskHandler for CollectorTaskHandler {
    fn run(&self, _task: &ScheduledTask) -> Result<String> {
        let name = self.collector.name();
        if !self.collector.is_configured() {
            return Ok(format!("{name}: not configured"));
        }
        let alerts = self.collector.alerts()?;
        Ok(match alerts.len() {
            0 => format!("{name}: all clear"),
            1 => format!("{name}: 1 alert: {}", alerts[0]),
            n => format!("{name}: {n} alerts: {}", alerts.join("; ")),
        })
    }
}
