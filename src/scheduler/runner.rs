//! Scheduler background loop.
//!
//! Spawns one OS thread that ticks on a fixed cadence, runs every due task
//! in sequence, and persists the task list to the settings store under
//! [`TASKS_KEY`]. All task executions (loop ticks and [`Scheduler::run_now`])
//! are serialized, so a task never overlaps with itself or with another task.

use crate::config::SchedulerConfig;
use crate::error::{OrchestratorError, Result, panic_message};
use crate::scheduler::handlers::HandlerRegistry;
use crate::scheduler::tasks::{
    RunningTask, ScheduledTask, TaskKind, TaskRunOutcome, TaskRunRecord,
};
use crate::settings::ConfigStore;
use chrono::{DateTime, TimeDelta, Utc};
use crossbeam_channel::{RecvTimeoutError, Sender};
use serde_json::Value;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Settings key holding the persisted task list.
pub const TASKS_KEY: &str = "scheduled_tasks";

/// Point-in-time scheduler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Task runs, successful or not.
    pub runs: u64,
    /// Runs whose handler returned an error or panicked.
    pub failures: u64,
    /// Failed writes of the task list.
    pub persist_failures: u64,
}

#[derive(Default)]
struct Counters {
    runs: AtomicU64,
    failures: AtomicU64,
    persist_failures: AtomicU64,
}

struct LoopHandle {
    /// `None` once a stop has been requested.
    stop_tx: Option<Sender<()>>,
    handle: JoinHandle<()>,
}

struct Shared {
    config: SchedulerConfig,
    settings: Arc<dyn ConfigStore>,
    handlers: HandlerRegistry,
    tasks: Mutex<Vec<ScheduledTask>>,
    /// Held for the whole of a tick or a manual run.
    exec_lock: Mutex<()>,
    running: Mutex<Option<RunningTask>>,
    history: Mutex<VecDeque<TaskRunRecord>>,
    loop_handle: Mutex<Option<LoopHandle>>,
    counters: Counters,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Persistent periodic task scheduler.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Create a scheduler and load the task list from `settings`.
    ///
    /// Entries that cannot be parsed (for example an unknown task type) are
    /// skipped with a warning. The loop is not started.
    pub fn new(
        config: SchedulerConfig,
        settings: Arc<dyn ConfigStore>,
        handlers: HandlerRegistry,
    ) -> Self {
        let tasks = load_tasks(settings.as_ref());
        debug!("loaded {} scheduled tasks", tasks.len());
        Self {
            shared: Arc::new(Shared {
                config,
                settings,
                handlers,
                tasks: Mutex::new(tasks),
                exec_lock: Mutex::new(()),
                running: Mutex::new(None),
                history: Mutex::new(VecDeque::new()),
                loop_handle: Mutex::new(None),
                counters: Counters::default(),
            }),
        }
    }

    /// Start the tick loop.
    ///
    /// Returns `true` if a new loop was started, `false` if one is already
    /// running or no task is enabled. A loop that is still winding down after
    /// [`stop`](Self::stop) is joined by the new loop thread before its first
    /// tick, so this call never waits on it.
    pub fn start(&self) -> bool {
        if !lock(&self.shared.tasks).iter().any(|t| t.enabled) {
            debug!("no enabled tasks, scheduler not started");
            return false;
        }

        let mut slot = lock(&self.shared.loop_handle);
        if slot
            .as_ref()
            .is_some_and(|h| h.stop_tx.is_some() && !h.handle.is_finished())
        {
            return false;
        }
        let previous = slot.take().map(|h| h.handle);

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("homelab-scheduler".to_owned())
            .spawn(move || {
                if let Some(previous) = previous {
                    if previous.join().is_err() {
                        warn!("previous scheduler loop panicked");
                    }
                }
                let tick = shared.config.tick_interval();
                info!(tick_secs = tick.as_secs(), "scheduler started");
                loop {
                    shared.tick_at(Utc::now());
                    match stop_rx.recv_timeout(tick) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("scheduler stopped");
            });

        match spawned {
            Ok(handle) => {
                *slot = Some(LoopHandle {
                    stop_tx: Some(stop_tx),
                    handle,
                });
                true
            }
            Err(e) => {
                error!("failed to spawn scheduler thread: {e}");
                false
            }
        }
    }

    /// Ask the loop to exit. A tick in progress finishes first.
    pub fn stop(&self) {
        if let Some(running) = lock(&self.shared.loop_handle).as_mut() {
            if let Some(stop_tx) = running.stop_tx.take() {
                let _ = stop_tx.try_send(());
            }
        }
    }

    /// Wait for a stopped loop to exit. Call [`stop`](Self::stop) first.
    pub fn join(&self) {
        let taken = lock(&self.shared.loop_handle).take();
        if let Some(running) = taken {
            if running.handle.join().is_err() {
                warn!("scheduler loop panicked");
            }
        }
    }

    /// Returns `true` while the tick loop is alive and not asked to stop.
    pub fn is_running(&self) -> bool {
        lock(&self.shared.loop_handle)
            .as_ref()
            .is_some_and(|h| h.stop_tx.is_some() && !h.handle.is_finished())
    }

    /// Run every task due at `now`, in list order. Returns the number run.
    pub fn tick_at(&self, now: DateTime<Utc>) -> usize {
        self.shared.tick_at(now)
    }

    /// Run one tick against the wall clock.
    pub fn tick(&self) -> usize {
        self.shared.tick_at(Utc::now())
    }

    /// Run a task immediately, ignoring its interval.
    ///
    /// Waits for any tick in progress. Handler failures are reported in the
    /// returned record, not as an error.
    ///
    /// # Errors
    ///
    /// Returns an error if no task has the given id.
    pub fn run_now(&self, task_id: &str) -> Result<TaskRunRecord> {
        let shared = &self.shared;
        let _exec = lock(&shared.exec_lock);
        let task = lock(&shared.tasks)
            .iter()
            .find(|t| t.id == task_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::Config(format!("unknown task: {task_id}")))?;

        let record = shared.execute(&task, Utc::now(), Instant::now());
        shared.save_tasks_logged();
        Ok(record)
    }

    /// Add a task and start the loop if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if `interval_secs` is zero or the task list cannot be
    /// persisted.
    pub fn add_task(&self, kind: TaskKind, interval_secs: u64) -> Result<ScheduledTask> {
        if interval_secs == 0 {
            return Err(OrchestratorError::Config(
                "task interval must be positive".to_owned(),
            ));
        }
        let task = ScheduledTask::new(kind, interval_secs);
        lock(&self.shared.tasks).push(task.clone());
        self.shared.save_tasks()?;
        info!(id = %task.id, kind = ?kind, interval_secs, "scheduled task added");
        self.start();
        Ok(task)
    }

    /// Remove a task. Returns `false` if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the task list cannot be persisted.
    pub fn remove_task(&self, task_id: &str) -> Result<bool> {
        let removed = {
            let mut tasks = lock(&self.shared.tasks);
            let before = tasks.len();
            tasks.retain(|t| t.id != task_id);
            tasks.len() != before
        };
        if removed {
            self.shared.save_tasks()?;
        }
        Ok(removed)
    }

    /// Enable or disable a task. Enabling also starts the loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the task list cannot be persisted.
    pub fn set_enabled(&self, task_id: &str, enabled: bool) -> Result<bool> {
        if !self.update_task(task_id, |t| t.enabled = enabled)? {
            return Ok(false);
        }
        if enabled {
            self.start();
        }
        Ok(true)
    }

    /// Change a task's interval.
    ///
    /// # Errors
    ///
    /// Returns an error if `interval_secs` is zero or the task list cannot be
    /// persisted.
    pub fn set_interval(&self, task_id: &str, interval_secs: u64) -> Result<bool> {
        if interval_secs == 0 {
            return Err(OrchestratorError::Config(
                "task interval must be positive".to_owned(),
            ));
        }
        self.update_task(task_id, |t| t.interval_secs = interval_secs)
    }

    /// Remove every task and stop the loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the task list cannot be persisted.
    pub fn clear_tasks(&self) -> Result<()> {
        lock(&self.shared.tasks).clear();
        self.stop();
        self.shared.save_tasks()
    }

    fn update_task(&self, task_id: &str, edit: impl FnOnce(&mut ScheduledTask)) -> Result<bool> {
        let found = {
            let mut tasks = lock(&self.shared.tasks);
            match tasks.iter_mut().find(|t| t.id == task_id) {
                Some(task) => {
                    edit(task);
                    true
                }
                None => false,
            }
        };
        if found {
            self.shared.save_tasks()?;
        }
        Ok(found)
    }

    pub fn tasks(&self) -> Vec<ScheduledTask> {
        lock(&self.shared.tasks).clone()
    }

    pub fn task(&self, task_id: &str) -> Option<ScheduledTask> {
        lock(&self.shared.tasks)
            .iter()
            .find(|t| t.id == task_id)
            .cloned()
    }

    /// The task currently executing, if any.
    pub fn running_task(&self) -> Option<RunningTask> {
        lock(&self.shared.running).clone()
    }

    /// Recent runs, oldest first.
    pub fn history(&self) -> Vec<TaskRunRecord> {
        lock(&self.shared.history).iter().cloned().collect()
    }

    pub fn stats(&self) -> SchedulerStats {
        let c = &self.shared.counters;
        SchedulerStats {
            runs: c.runs.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            persist_failures: c.persist_failures.load(Ordering::Relaxed),
        }
    }
}

impl Shared {
    fn tick_at(&self, now: DateTime<Utc>) -> usize {
        let _exec = lock(&self.exec_lock);
        let tick_started = Instant::now();

        let due: Vec<ScheduledTask> = lock(&self.tasks)
            .iter()
            .filter(|t| t.is_due_at(now))
            .cloned()
            .collect();

        for task in &due {
            self.execute(task, now, tick_started);
        }

        let ran_any = !due.is_empty();
        if ran_any {
            self.save_tasks_logged();
        }
        due.len()
    }

    /// Run one task and record its bookkeeping.
    ///
    /// Timestamps are `clock_base` plus the real time elapsed since
    /// `mono_base`, which keeps [`Scheduler::tick_at`] deterministic.
    fn execute(
        &self,
        task: &ScheduledTask,
        clock_base: DateTime<Utc>,
        mono_base: Instant,
    ) -> TaskRunRecord {
        let clock = || clock_base + TimeDelta::from_std(mono_base.elapsed()).unwrap_or(TimeDelta::zero());

        let started_at = clock();
        *lock(&self.running) = Some(RunningTask {
            task_id: task.id.clone(),
            kind: task.kind,
            started_at,
        });
        debug!(id = %task.id, kind = ?task.kind, "running scheduled task");

        let result = catch_unwind(AssertUnwindSafe(|| self.handlers.run(task)));
        *lock(&self.running) = None;
        let finished_at = clock();

        let (outcome, summary) = match result {
            Ok(Ok(summary)) => (TaskRunOutcome::Success, summary),
            Ok(Err(e)) => (TaskRunOutcome::Failed, e.to_string()),
            Err(payload) => (
                TaskRunOutcome::Failed,
                format!("handler panicked: {}", panic_message(payload.as_ref())),
            ),
        };

        self.counters.runs.fetch_add(1, Ordering::Relaxed);
        if outcome == TaskRunOutcome::Failed {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            warn!(id = %task.id, kind = ?task.kind, "scheduled task failed: {summary}");
        } else {
            info!(id = %task.id, kind = ?task.kind, "scheduled task done: {summary}");
        }

        if let Some(entry) = lock(&self.tasks).iter_mut().find(|t| t.id == task.id) {
            entry.mark_run(finished_at);
        }

        let record = TaskRunRecord {
            task_id: task.id.clone(),
            kind: task.kind,
            started_at,
            finished_at,
            outcome,
            summary,
        };
        self.push_history(record.clone());
        record
    }

    fn push_history(&self, record: TaskRunRecord) {
        let limit = self.config.history_limit.max(1);
        let mut history = lock(&self.history);
        history.push_back(record);
        while history.len() > limit {
            history.pop_front();
        }
    }

    fn save_tasks(&self) -> Result<()> {
        let value = {
            let tasks = lock(&self.tasks);
            serde_json::to_value(&*tasks)?
        };
        self.settings.set(TASKS_KEY, value);
        self.settings.persist()
    }

    fn save_tasks_logged(&self) {
        if let Err(e) = self.save_tasks() {
            self.counters.persist_failures.fetch_add(1, Ordering::Relaxed);
            error!("cannot persist scheduled tasks: {e}");
        }
    }
}

fn load_tasks(settings: &dyn ConfigStore) -> Vec<ScheduledTask> {
    let Some(Value::Array(entries)) = settings.get(TASKS_KEY) else {
        return Vec::new();
    };
    entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value::<ScheduledTask>(entry) {
            Ok(task) => Some(task),
            Err(e) => {
                warn!("skipping unreadable scheduled task: {e}");
                None
            }
        })
        .collect()
}
