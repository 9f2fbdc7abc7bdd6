//! Persistent periodic task scheduler.
//!
//! Recurring tasks live in the settings store. A single background thread
//! ticks once a minute and runs each due task, one at a time, against the
//! handler registered for its [`TaskKind`].

pub mod handlers;
pub mod runner;
pub mod tasks;
pub mod updates;

pub use handlers::{CollectorTaskHandler, ConfigBackupHandler, HandlerRegistry, TaskHandler};
pub use runner::{Scheduler, SchedulerStats, TASKS_KEY};
pub use tasks::{
    INTERVAL_PRESETS, RunningTask, ScheduledTask, TaskKind, TaskRunOutcome, TaskRunRecord,
    format_interval,
};
pub use updates::UpdateCheckHandler;
