//! FIFO transfer queue drained by one background worker.
//!
//! The worker is started lazily by the first [`TransferQueue::enqueue`] and
//! processes one job at a time. Stopping it lets the in-flight job finish;
//! jobs still pending stay queued until a worker runs again.

use super::job::{TransferJob, TransferStatus};
use super::transport::Transport;
use crate::config::TransferConfig;
use crate::error::panic_message;
use crate::notify::Notifier;
use crossbeam_channel::{Receiver, Sender, TryRecvError, select};
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Title used for transfer notifications.
const NOTIFY_TITLE: &str = "Homelab";

/// Point-in-time queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub succeeded: u64,
    pub failed: u64,
    /// Success notifications that could not be delivered.
    pub notify_failures: u64,
}

#[derive(Default)]
struct Counters {
    succeeded: AtomicU64,
    failed: AtomicU64,
    notify_failures: AtomicU64,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<TransferJob>,
    in_flight: Option<TransferJob>,
    history: VecDeque<TransferJob>,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_none()
    }
}

struct Worker {
    /// `None` once a stop has been requested.
    stop_tx: Option<Sender<()>>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn is_active(&self) -> bool {
        self.stop_tx.is_some() && !self.handle.is_finished()
    }
}

struct Shared {
    config: TransferConfig,
    transport: Arc<dyn Transport>,
    notifier: Arc<dyn Notifier>,
    state: Mutex<QueueState>,
    /// Signalled whenever a job finishes or the worker goes idle.
    progress: Condvar,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    worker: Mutex<Option<Worker>>,
    counters: Counters,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Durable FIFO of transfer jobs.
#[derive(Clone)]
pub struct TransferQueue {
    shared: Arc<Shared>,
}

impl TransferQueue {
    pub fn new(
        config: TransferConfig,
        transport: Arc<dyn Transport>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        Self {
            shared: Arc::new(Shared {
                config,
                transport,
                notifier,
                state: Mutex::new(QueueState::default()),
                progress: Condvar::new(),
                wake_tx,
                wake_rx,
                worker: Mutex::new(None),
                counters: Counters::default(),
            }),
        }
    }

    /// Append a job, wake the worker, and start one if none is running.
    ///
    /// Returns the job id.
    pub fn enqueue(&self, mut job: TransferJob) -> String {
        job.status = TransferStatus::Pending;
        let id = job.id.clone();
        info!(id = %id, source = %job.basename(), dest = %job.destination_spec(), "transfer queued");
        lock(&self.shared.state).pending.push_back(job);

        // A full channel already holds a wake-up.
        let _ = self.shared.wake_tx.try_send(());
        if !self.is_worker_running() {
            self.start_worker();
        }
        id
    }

    /// Start the worker. Returns `false` if one is already running.
    ///
    /// A worker still finishing its in-flight job after
    /// [`stop_worker`](Self::stop_worker) is joined by the new worker before
    /// it takes any job, so only one worker ever drains the queue.
    pub fn start_worker(&self) -> bool {
        let mut slot = lock(&self.shared.worker);
        if slot.as_ref().is_some_and(Worker::is_active) {
            return false;
        }
        let previous = slot.take().map(|w| w.handle);

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("homelab-transfers".to_owned())
            .spawn(move || {
                if let Some(previous) = previous {
                    if previous.join().is_err() {
                        warn!("previous transfer worker panicked");
                    }
                }
                shared.worker_loop(&stop_rx);
            });

        match spawned {
            Ok(handle) => {
                *slot = Some(Worker {
                    stop_tx: Some(stop_tx),
                    handle,
                });
                debug!("transfer worker started");
                true
            }
            Err(e) => {
                error!("failed to spawn transfer worker: {e}");
                false
            }
        }
    }

    /// Ask the worker to exit after its in-flight job.
    pub fn stop_worker(&self) {
        if let Some(worker) = lock(&self.shared.worker).as_mut() {
            if let Some(stop_tx) = worker.stop_tx.take() {
                let _ = stop_tx.try_send(());
                debug!("transfer worker stopping");
            }
        }
    }

    /// Wait for the worker thread to exit. Call
    /// [`stop_worker`](Self::stop_worker) first.
    pub fn join_worker(&self) {
        let taken = lock(&self.shared.worker).take();
        if let Some(worker) = taken {
            if worker.handle.join().is_err() {
                warn!("transfer worker panicked");
            }
        }
    }

    pub fn is_worker_running(&self) -> bool {
        lock(&self.shared.worker).as_ref().is_some_and(Worker::is_active)
    }

    /// Block until nothing is pending or in flight, or `timeout` passes.
    ///
    /// Returns `true` if the queue drained.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let state = lock(&self.shared.state);
        let (state, _) = self
            .shared
            .progress
            .wait_timeout_while(state, timeout, |s| !s.is_idle())
            .unwrap_or_else(PoisonError::into_inner);
        state.is_idle()
    }

    /// Drop every pending job. Returns how many were removed.
    pub fn clear_queue(&self) -> usize {
        let cleared = {
            let mut state = lock(&self.shared.state);
            let n = state.pending.len();
            state.pending.clear();
            n
        };
        self.shared.progress.notify_all();
        info!(cleared, "transfer queue cleared");
        cleared
    }

    pub fn clear_history(&self) {
        lock(&self.shared.state).history.clear();
    }

    /// Pending jobs in queue order.
    pub fn pending(&self) -> Vec<TransferJob> {
        lock(&self.shared.state).pending.iter().cloned().collect()
    }

    /// Finished jobs, oldest first.
    pub fn history(&self) -> Vec<TransferJob> {
        lock(&self.shared.state).history.iter().cloned().collect()
    }

    pub fn in_flight(&self) -> Option<TransferJob> {
        lock(&self.shared.state).in_flight.clone()
    }

    pub fn stats(&self) -> QueueStats {
        let c = &self.shared.counters;
        QueueStats {
            succeeded: c.succeeded.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            notify_failures: c.notify_failures.load(Ordering::Relaxed),
        }
    }
}

impl Shared {
    fn worker_loop(&self, stop_rx: &Receiver<()>) {
        loop {
            if !matches!(stop_rx.try_recv(), Err(TryRecvError::Empty)) {
                break;
            }

            let next = {
                let mut state = lock(&self.state);
                let job = state.pending.pop_front();
                state.in_flight.clone_from(&job);
                job
            };

            match next {
                Some(job) => self.process(job),
                None => {
                    self.progress.notify_all();
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(self.wake_rx) -> _ => {}
                        default(self.config.idle_poll()) => {}
                    }
                }
            }
        }
        debug!("transfer worker exited");
    }

    fn process(&self, mut job: TransferJob) {
        let result = catch_unwind(AssertUnwindSafe(|| self.transport.execute_transfer(&job)));
        match result {
            Ok(Ok(outcome)) if outcome.ok => {
                job.finish(TransferStatus::Success, None, outcome.summary);
            }
            Ok(Ok(outcome)) => {
                let reason = match outcome.exit_code {
                    Some(code) => format!("exited with status {code}"),
                    None => "terminated by signal".to_owned(),
                };
                job.finish(TransferStatus::Failed, Some(reason), None);
            }
            Ok(Err(e)) => job.finish(TransferStatus::Failed, Some(e.to_string()), None),
            Err(payload) => job.finish(
                TransferStatus::Failed,
                Some(format!("transport panicked: {}", panic_message(payload.as_ref()))),
                None,
            ),
        }

        if job.status == TransferStatus::Success {
            self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
            info!(id = %job.id, source = %job.basename(), summary = ?job.summary, "transfer complete");
            self.notify_complete(&job);
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                id = %job.id,
                source = %job.basename(),
                "transfer failed: {}",
                job.error.as_deref().unwrap_or("unknown error")
            );
        }

        {
            let limit = self.config.history_limit.max(1);
            let mut state = lock(&self.state);
            state.in_flight = None;
            state.history.push_back(job);
            while state.history.len() > limit {
                state.history.pop_front();
            }
        }
        self.progress.notify_all();
    }

    fn notify_complete(&self, job: &TransferJob) {
        let message = format!("Transfer complete: {}", job.basename());
        let delivered = catch_unwind(AssertUnwindSafe(|| {
            self.notifier.notify(NOTIFY_TITLE, &message)
        }));
        match delivered {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.counters.notify_failures.fetch_add(1, Ordering::Relaxed);
                debug!("transfer notification failed: {e}");
            }
            Err(_) => {
                self.counters.notify_failures.fetch_add(1, Ordering::Relaxed);
                debug!("transfer notifier panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::error::{OrchestratorError, Result};
    use crate::notify::NoopNotifier;
    use crate::transfer::transport::TransferOutcome;
    use crossbeam_channel::unbounded;

    const WAIT: Duration = Duration::from_secs(10);

    fn test_config() -> TransferConfig {
        TransferConfig {
            idle_poll_ms: 50,
            ..TransferConfig::default()
        }
    }

    /// Records sources; fails any source containing "fail", panics on "panic".
    #[derive(Default)]
    struct Scripted {
        calls: Mutex<Vec<String>>,
    }

    impl Transport for Scripted {
        fn execute_transfer(&self, job: &TransferJob) -> Result<TransferOutcome> {
            self.calls.lock().unwrap().push(job.source.clone());
            if job.source.contains("panic") {
                panic!("transport bug");
            }
            if job.source.contains("error") {
                return Err(OrchestratorError::Transfer("ssh: connection refused".to_owned()));
            }
            if job.source.contains("fail") {
                return Ok(TransferOutcome::failure(Some(23)));
            }
            Ok(TransferOutcome::success())
        }
    }

    /// Blocks each transfer until the test sends a release token.
    struct Gated {
        entered: Sender<String>,
        release: Receiver<()>,
    }

    impl Transport for Gated {
        fn execute_transfer(&self, job: &TransferJob) -> Result<TransferOutcome> {
            let _ = self.entered.send(job.source.clone());
            let _ = self.release.recv();
            Ok(TransferOutcome::success())
        }
    }

    #[derive(Default)]
    struct Recording {
        messages: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    impl Notifier for Recording {
        fn notify(&self, title: &str, message: &str) -> Result<()> {
            self.messages
                .lock()
                .unwrap()
                .push((title.to_owned(), message.to_owned()));
            if self.fail {
                Err(OrchestratorError::Notify("no display".to_owned()))
            } else {
                Ok(())
            }
        }
    }

    fn sources(jobs: &[TransferJob]) -> Vec<&str> {
        jobs.iter().map(|j| j.source.as_str()).collect()
    }

    #[test]
    fn jobs_complete_in_submission_order() {
        let transport = Arc::new(Scripted::default());
        let queue = TransferQueue::new(test_config(), transport.clone(), Arc::new(NoopNotifier));

        for name in ["A", "B", "C"] {
            queue.enqueue(TransferJob::new(name, "nas:/incoming/"));
        }
        assert!(queue.wait_idle(WAIT));

        assert_eq!(sources(&queue.history()), ["A", "B", "C"]);
        assert_eq!(*transport.calls.lock().unwrap(), ["A", "B", "C"]);
        assert!(queue.history().iter().all(|j| j.finished_at.is_some()));
    }

    #[test]
    fn failures_are_terminal_and_the_worker_survives() {
        let transport = Arc::new(Scripted::default());
        let queue = TransferQueue::new(test_config(), transport.clone(), Arc::new(NoopNotifier));

        queue.enqueue(TransferJob::new("/data/one.mkv", "nas:/in/"));
        queue.enqueue(TransferJob::new("/data/fail.mkv", "nas:/in/"));
        queue.enqueue(TransferJob::new("/data/three.mkv", "nas:/in/"));
        assert!(queue.wait_idle(WAIT));

        let statuses: Vec<TransferStatus> = queue.history().iter().map(|j| j.status).collect();
        assert_eq!(
            statuses,
            [TransferStatus::Success, TransferStatus::Failed, TransferStatus::Success]
        );
        assert_eq!(queue.history()[1].error.as_deref(), Some("exited with status 23"));
        assert!(queue.pending().is_empty());
        assert!(queue.is_worker_running());
        // Never retried.
        assert_eq!(transport.calls.lock().unwrap().len(), 3);

        let stats = queue.stats();
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn transport_errors_and_panics_fail_only_their_job() {
        let transport = Arc::new(Scripted::default());
        let queue = TransferQueue::new(test_config(), transport, Arc::new(NoopNotifier));

        queue.enqueue(TransferJob::new("error.iso", "nas:/in/"));
        queue.enqueue(TransferJob::new("panic.iso", "nas:/in/"));
        queue.enqueue(TransferJob::new("fine.iso", "nas:/in/"));
        assert!(queue.wait_idle(WAIT));

        let history = queue.history();
        assert_eq!(history[0].status, TransferStatus::Failed);
        assert!(history[0].error.as_deref().unwrap().contains("connection refused"));
        assert_eq!(history[1].status, TransferStatus::Failed);
        assert!(history[1].error.as_deref().unwrap().contains("transport bug"));
        assert_eq!(history[2].status, TransferStatus::Success);
        assert!(queue.is_worker_running());
    }

    #[test]
    fn stopping_mid_queue_keeps_remaining_jobs_pending() {
        let (entered_tx, entered_rx) = unbounded();
        let (release_tx, release_rx) = unbounded();
        let queue = TransferQueue::new(
            test_config(),
            Arc::new(Gated {
                entered: entered_tx,
                release: release_rx,
            }),
            Arc::new(NoopNotifier),
        );

        queue.enqueue(TransferJob::new("A", "nas:/in/"));
        queue.enqueue(TransferJob::new("B", "nas:/in/"));
        queue.enqueue(TransferJob::new("C", "nas:/in/"));
        assert_eq!(entered_rx.recv_timeout(WAIT).unwrap(), "A");
        assert_eq!(queue.in_flight().unwrap().source, "A");

        queue.stop_worker();
        assert!(!queue.is_worker_running());
        release_tx.send(()).unwrap();
        queue.join_worker();

        assert_eq!(sources(&queue.history()), ["A"]);
        let pending = queue.pending();
        assert_eq!(sources(&pending), ["B", "C"]);
        assert!(pending.iter().all(|j| j.status == TransferStatus::Pending));
        assert!(queue.in_flight().is_none());
        assert!(!queue.wait_idle(Duration::from_millis(100)));

        // A new enqueue restarts the worker and drains everything in order.
        for _ in 0..3 {
            release_tx.send(()).unwrap();
        }
        queue.enqueue(TransferJob::new("D", "nas:/in/"));
        assert!(queue.wait_idle(WAIT));
        assert_eq!(sources(&queue.history()), ["A", "B", "C", "D"]);
    }

    #[test]
    fn restart_while_stopping_never_runs_two_workers() {
        let (entered_tx, entered_rx) = unbounded();
        let (release_tx, release_rx) = unbounded();
        let queue = TransferQueue::new(
            test_config(),
            Arc::new(Gated {
                entered: entered_tx,
                release: release_rx,
            }),
            Arc::new(NoopNotifier),
        );

        queue.enqueue(TransferJob::new("A", "nas:/in/"));
        queue.enqueue(TransferJob::new("B", "nas:/in/"));
        assert_eq!(entered_rx.recv_timeout(WAIT).unwrap(), "A");

        queue.stop_worker();
        assert!(queue.start_worker());
        assert!(!queue.start_worker());

        // B cannot start until A's worker has exited.
        assert!(entered_rx.recv_timeout(Duration::from_millis(100)).is_err());
        release_tx.send(()).unwrap();
        assert_eq!(entered_rx.recv_timeout(WAIT).unwrap(), "B");
        release_tx.send(()).unwrap();

        assert!(queue.wait_idle(WAIT));
        assert_eq!(sources(&queue.history()), ["A", "B"]);
    }

    #[test]
    fn success_notifies_with_basename() {
        let notifier = Arc::new(Recording::default());
        let queue = TransferQueue::new(
            test_config(),
            Arc::new(Scripted::default()),
            notifier.clone(),
        );

        queue.enqueue(TransferJob::new("/movies/Heat (1995).mkv", "nas:/in/"));
        queue.enqueue(TransferJob::new("/movies/fail.mkv", "nas:/in/"));
        assert!(queue.wait_idle(WAIT));

        assert_eq!(
            *notifier.messages.lock().unwrap(),
            [("Homelab".to_owned(), "Transfer complete: Heat (1995).mkv".to_owned())]
        );
    }

    #[test]
    fn notification_failure_does_not_fail_the_job() {
        let notifier = Arc::new(Recording {
            fail: true,
            ..Recording::default()
        });
        let queue = TransferQueue::new(test_config(), Arc::new(Scripted::default()), notifier);

        queue.enqueue(TransferJob::new("a.txt", "nas:/in/"));
        assert!(queue.wait_idle(WAIT));
        assert_eq!(queue.history()[0].status, TransferStatus::Success);
        assert_eq!(queue.stats().notify_failures, 1);
    }

    #[test]
    fn history_is_bounded_and_clearable() {
        let config = TransferConfig {
            history_limit: 2,
            ..test_config()
        };
        let queue = TransferQueue::new(config, Arc::new(Scripted::default()), Arc::new(NoopNotifier));
        for name in ["1", "2", "3", "4"] {
            queue.enqueue(TransferJob::new(name, "nas:/in/"));
        }
        assert!(queue.wait_idle(WAIT));
        assert_eq!(sources(&queue.history()), ["3", "4"]);

        queue.clear_history();
        assert!(queue.history().is_empty());
    }

    #[test]
    fn clear_queue_drops_pending_jobs() {
        let (entered_tx, entered_rx) = unbounded();
        let (release_tx, release_rx) = unbounded();
        let queue = TransferQueue::new(
            test_config(),
            Arc::new(Gated {
                entered: entered_tx,
                release: release_rx,
            }),
            Arc::new(NoopNotifier),
        );

        queue.enqueue(TransferJob::new("A", "nas:/in/"));
        queue.enqueue(TransferJob::new("B", "nas:/in/"));
        queue.enqueue(TransferJob::new("C", "nas:/in/"));
        entered_rx.recv_timeout(WAIT).unwrap();

        assert_eq!(queue.clear_queue(), 2);
        release_tx.send(()).unwrap();
        assert!(queue.wait_idle(WAIT));
        assert_eq!(sources(&queue.history()), ["A"]);
    }
}
