//! Single-flight status aggregator.
//!
//! A refresh fans out to every registered collector on a short-lived worker
//! pool, waits under two tiers of timeouts (per collector and per refresh),
//! and swaps the merged result in as a new [`RefreshSnapshot`]. Readers never
//! block on a refresh: [`StatusAggregator::current_snapshot`] only clones an
//! `Arc` under a read lock.
//!
//! A failing `alerts` or `stat_line` call only drops that half of the
//! collector's output. Collectors that panic or miss their deadline contribute
//! nothing. Their threads are not killed; anything they send after the
//! coordinator has moved on lands in a dropped channel.

pub mod snapshot;

pub use snapshot::{RefreshSnapshot, SnapshotCache};

use crate::collector::{Collector, CollectorResult, collect};
use crate::config::AggregatorConfig;
use crate::error::panic_message;
use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Where a collector's output lands in the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Plugin,
    Health,
    Connectivity,
}

struct Job {
    index: usize,
    role: Role,
    collector: Arc<dyn Collector>,
}

enum Outcome {
    Done(CollectorResult),
    NotConfigured,
    Failed(String),
}

enum Event {
    Started { index: usize, at: Instant },
    Finished { index: usize, outcome: Outcome, elapsed: Duration },
}

/// Summary of one refresh cycle, returned by [`RefreshHandle::wait`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// Collectors whose calls all succeeded.
    pub succeeded: Vec<String>,
    /// Collectors with a failed `alerts` or `stat_line` call. Whatever the
    /// other call produced is still in the snapshot.
    pub degraded: Vec<String>,
    /// Collectors that panicked and contributed nothing.
    pub failed: Vec<String>,
    /// Collectors that exceeded their own timeout or the refresh deadline.
    pub timed_out: Vec<String>,
    /// Collectors that reported themselves as not configured.
    pub skipped: Vec<String>,
    /// Whether the snapshot cache was written.
    pub persisted: bool,
    /// Wall-clock duration of the cycle.
    pub duration: Duration,
}

/// Point-in-time aggregator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    /// Completed refresh cycles.
    pub refreshes: u64,
    /// `request_refresh` calls rejected because a refresh was running.
    pub skipped_requests: u64,
    /// Collectors that panicked.
    pub collector_failures: u64,
    /// Individual `alerts` / `stat_line` calls that returned an error.
    pub call_failures: u64,
    /// Collectors that missed a deadline.
    pub collector_timeouts: u64,
    /// Failed snapshot cache writes.
    pub persist_failures: u64,
}

#[derive(Default)]
struct Counters {
    refreshes: AtomicU64,
    skipped_requests: AtomicU64,
    collector_failures: AtomicU64,
    call_failures: AtomicU64,
    collector_timeouts: AtomicU64,
    persist_failures: AtomicU64,
}

struct Shared {
    config: AggregatorConfig,
    plugins: Vec<Arc<dyn Collector>>,
    health: Option<Arc<dyn Collector>>,
    connectivity: Option<Arc<dyn Collector>>,
    cache: Option<SnapshotCache>,
    snapshot: RwLock<Arc<RefreshSnapshot>>,
    refreshing: AtomicBool,
    /// Set under the snapshot write lock once a refresh has swapped in.
    refreshed_once: AtomicBool,
    counters: Counters,
}

/// Clears the single-flight flag when dropped, including on panic.
struct InFlightGuard {
    shared: Arc<Shared>,
}

impl InFlightGuard {
    fn acquire(shared: &Arc<Shared>) -> Option<Self> {
        shared
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                shared: Arc::clone(shared),
            })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.shared.refreshing.store(false, Ordering::Release);
    }
}

/// Handle to a refresh running on a background thread.
pub struct RefreshHandle {
    handle: JoinHandle<RefreshReport>,
}

impl RefreshHandle {
    /// Block until the refresh has finished and its snapshot is visible.
    pub fn wait(self) -> RefreshReport {
        self.handle.join().unwrap_or_default()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Builder for [`StatusAggregator`].
pub struct AggregatorBuilder {
    config: AggregatorConfig,
    plugins: Vec<Arc<dyn Collector>>,
    health: Option<Arc<dyn Collector>>,
    connectivity: Option<Arc<dyn Collector>>,
    cache: Option<SnapshotCache>,
}

impl AggregatorBuilder {
    /// Register a plugin collector. Registration order is presentation order.
    pub fn with_plugin(mut self, collector: Arc<dyn Collector>) -> Self {
        self.plugins.push(collector);
        self
    }

    /// Set the consolidated health-check collector.
    pub fn with_health_collector(mut self, collector: Arc<dyn Collector>) -> Self {
        self.health = Some(collector);
        self
    }

    /// Set the SSH connectivity collector.
    pub fn with_connectivity_collector(mut self, collector: Arc<dyn Collector>) -> Self {
        self.connectivity = Some(collector);
        self
    }

    /// Persist stat lines to `cache` after each refresh.
    pub fn with_cache(mut self, cache: SnapshotCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> StatusAggregator {
        StatusAggregator {
            shared: Arc::new(Shared {
                config: self.config,
                plugins: self.plugins,
                health: self.health,
                connectivity: self.connectivity,
                cache: self.cache,
                snapshot: RwLock::new(Arc::new(RefreshSnapshot::empty())),
                refreshing: AtomicBool::new(false),
                refreshed_once: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        }
    }
}

/// Concurrent, single-flight status aggregator.
#[derive(Clone)]
pub struct StatusAggregator {
    shared: Arc<Shared>,
}

impl StatusAggregator {
    pub fn builder(config: AggregatorConfig) -> AggregatorBuilder {
        AggregatorBuilder {
            config,
            plugins: Vec::new(),
            health: None,
            connectivity: None,
            cache: None,
        }
    }

    /// Start a refresh in the background.
    ///
    /// Returns `None` without scheduling anything when a refresh is already
    /// running (or the refresh thread could not be spawned).
    pub fn request_refresh(&self) -> Option<RefreshHandle> {
        let Some(guard) = InFlightGuard::acquire(&self.shared) else {
            self.shared
                .counters
                .skipped_requests
                .fetch_add(1, Ordering::Relaxed);
            debug!("refresh already in flight, request dropped");
            return None;
        };

        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("homelab-refresh".to_owned())
            .spawn(move || {
                let _guard = guard;
                shared.run_refresh()
            });

        match spawned {
            Ok(handle) => Some(RefreshHandle { handle }),
            Err(e) => {
                error!("failed to spawn refresh thread: {e}");
                None
            }
        }
    }

    /// Run a refresh and wait for it. Returns `None` if one was already running.
    pub fn refresh_blocking(&self) -> Option<RefreshReport> {
        self.request_refresh().map(RefreshHandle::wait)
    }

    /// The latest snapshot. Never blocks on a running refresh.
    pub fn current_snapshot(&self) -> Arc<RefreshSnapshot> {
        Arc::clone(
            &self
                .shared
                .snapshot
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    pub fn is_refreshing(&self) -> bool {
        self.shared.refreshing.load(Ordering::Acquire)
    }

    /// Load cached stat lines so the dashboard has something to show before
    /// the first refresh completes.
    ///
    /// Returns `true` when a cached snapshot was installed. A cache is never
    /// installed over the result of a completed refresh.
    pub fn restore_cached(&self) -> bool {
        let Some(cache) = &self.shared.cache else {
            return false;
        };
        let cached = match cache.load() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return false,
            Err(e) => {
                warn!(path = %cache.path().display(), "ignoring unreadable snapshot cache: {e}");
                return false;
            }
        };

        let mut current = self
            .shared
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if self.shared.refreshed_once.load(Ordering::Acquire) {
            return false;
        }
        debug!(stats = cached.stats().len(), "restored cached snapshot");
        *current = Arc::new(cached);
        true
    }

    pub fn stats(&self) -> AggregatorStats {
        let c = &self.shared.counters;
        AggregatorStats {
            refreshes: c.refreshes.load(Ordering::Relaxed),
            skipped_requests: c.skipped_requests.load(Ordering::Relaxed),
            collector_failures: c.collector_failures.load(Ordering::Relaxed),
            call_failures: c.call_failures.load(Ordering::Relaxed),
            collector_timeouts: c.collector_timeouts.load(Ordering::Relaxed),
            persist_failures: c.persist_failures.load(Ordering::Relaxed),
        }
    }
}

impl Shared {
    fn jobs(&self) -> Vec<Job> {
        let plugins = self.plugins.iter().map(|c| (Role::Plugin, c));
        let health = self.health.iter().map(|c| (Role::Health, c));
        let connectivity = self.connectivity.iter().map(|c| (Role::Connectivity, c));
        plugins
            .chain(health)
            .chain(connectivity)
            .enumerate()
            .map(|(index, (role, collector))| Job {
                index,
                role,
                collector: Arc::clone(collector),
            })
            .collect()
    }

    fn run_refresh(&self) -> RefreshReport {
        let started = Instant::now();
        let jobs = self.jobs();
        let names: Vec<String> = jobs.iter().map(|j| j.collector.name().to_owned()).collect();
        let roles: Vec<Role> = jobs.iter().map(|j| j.role).collect();

        let slots = self.gather(jobs);

        let mut report = RefreshReport::default();
        let mut alerts = Vec::new();
        let mut stats = Vec::new();
        let mut call_failures = 0_u64;
        for ((slot, name), role) in slots.into_iter().zip(names).zip(roles) {
            match slot {
                Slot::Done(result) => {
                    alerts.extend(result.alerts);
                    if role == Role::Plugin {
                        stats.extend(result.stat);
                    }
                    if result.errors.is_empty() {
                        report.succeeded.push(name);
                    } else {
                        for e in &result.errors {
                            warn!(collector = %name, "collector call failed: {e}");
                        }
                        call_failures += result.errors.len() as u64;
                        report.degraded.push(name);
                    }
                }
                Slot::NotConfigured => report.skipped.push(name),
                Slot::Failed(reason) => {
                    warn!(collector = %name, "collector failed: {reason}");
                    report.failed.push(name);
                }
                Slot::TimedOut => {
                    warn!(collector = %name, "collector timed out");
                    report.timed_out.push(name);
                }
            }
        }

        let snapshot = Arc::new(RefreshSnapshot::new(alerts, stats, Utc::now()));
        {
            let mut current = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
            *current = Arc::clone(&snapshot);
            self.refreshed_once.store(true, Ordering::Release);
        }

        if let Some(cache) = &self.cache {
            match cache.save(&snapshot) {
                Ok(()) => report.persisted = true,
                Err(e) => {
                    self.counters.persist_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(path = %cache.path().display(), "failed to persist snapshot: {e}");
                }
            }
        }

        let c = &self.counters;
        c.refreshes.fetch_add(1, Ordering::Relaxed);
        c.collector_failures
            .fetch_add(report.failed.len() as u64, Ordering::Relaxed);
        c.call_failures.fetch_add(call_failures, Ordering::Relaxed);
        c.collector_timeouts
            .fetch_add(report.timed_out.len() as u64, Ordering::Relaxed);

        report.duration = started.elapsed();
        info!(
            ok = report.succeeded.len(),
            degraded = report.degraded.len(),
            failed = report.failed.len(),
            timed_out = report.timed_out.len(),
            alerts = snapshot.alerts().len(),
            elapsed_ms = report.duration.as_millis() as u64,
            "status refresh complete"
        );
        report
    }

    /// Run `jobs` on a fresh pool and collect one slot per job, in job order.
    fn gather(&self, jobs: Vec<Job>) -> Vec<Slot> {
        let count = jobs.len();
        if count == 0 {
            return Vec::new();
        }

        let collector_timeout = self.config.collector_timeout();
        let total_deadline = Instant::now() + self.config.total_timeout();
        let pool = self.config.pool_size(self.plugins.len()).min(count);

        let (job_tx, job_rx) = crossbeam_channel::unbounded::<Job>();
        let (event_tx, event_rx) = crossbeam_channel::unbounded::<Event>();
        let abandoned = Arc::new(AtomicBool::new(false));

        for job in jobs {
            // The receiver is alive in this scope; send cannot fail.
            let _ = job_tx.send(job);
        }
        drop(job_tx);

        for n in 0..pool {
            let job_rx = job_rx.clone();
            let event_tx = event_tx.clone();
            let abandoned = Arc::clone(&abandoned);
            let spawned = std::thread::Builder::new()
                .name(format!("homelab-collector-{n}"))
                .spawn(move || worker_loop(&job_rx, &event_tx, &abandoned));
            if let Err(e) = spawned {
                error!("failed to spawn collector worker: {e}");
            }
        }
        drop(event_tx);
        drop(job_rx);

        let slots = wait_for_events(&event_rx, count, collector_timeout, total_deadline);
        abandoned.store(true, Ordering::Release);
        slots
    }
}

enum Slot {
    Done(CollectorResult),
    NotConfigured,
    Failed(String),
    TimedOut,
}

fn worker_loop(jobs: &Receiver<Job>, events: &Sender<Event>, abandoned: &AtomicBool) {
    for job in jobs.iter() {
        if abandoned.load(Ordering::Acquire) {
            break;
        }
        let at = Instant::now();
        if events.send(Event::Started { index: job.index, at }).is_err() {
            break;
        }
        let outcome = run_collector(job.collector.as_ref());
        let finished = Event::Finished {
            index: job.index,
            outcome,
            elapsed: at.elapsed(),
        };
        if events.send(finished).is_err() {
            debug!(collector = %job.collector.name(), "late result discarded");
            break;
        }
    }
}

fn run_collector(collector: &dyn Collector) -> Outcome {
    let result = catch_unwind(AssertUnwindSafe(|| {
        collector.is_configured().then(|| collect(collector))
    }));
    match result {
        Ok(Some(result)) => Outcome::Done(result),
        Ok(None) => Outcome::NotConfigured,
        Err(payload) => Outcome::Failed(format!("panicked: {}", panic_message(payload.as_ref()))),
    }
}

/// Drain worker events until every job has reported or the last pending
/// deadline has passed. Jobs still pending at that point are timed out.
fn wait_for_events(
    events: &Receiver<Event>,
    count: usize,
    collector_timeout: Duration,
    total_deadline: Instant,
) -> Vec<Slot> {
    let mut started: Vec<Option<Instant>> = vec![None; count];
    let mut slots: Vec<Option<Slot>> = (0..count).map(|_| None).collect();
    let mut remaining = count;

    while remaining > 0 {
        let deadline = slots
            .iter()
            .zip(&started)
            .filter(|(slot, _)| slot.is_none())
            .map(|(_, at)| match at {
                Some(at) => (*at + collector_timeout).min(total_deadline),
                None => total_deadline,
            })
            .max()
            .unwrap_or(total_deadline);

        let now = Instant::now();
        if now >= deadline {
            break;
        }

        match events.recv_timeout(deadline - now) {
            Ok(Event::Started { index, at }) => started[index] = Some(at),
            Ok(Event::Finished {
                index,
                outcome,
                elapsed,
            }) => {
                let slot = if elapsed > collector_timeout {
                    Slot::TimedOut
                } else {
                    match outcome {
                        Outcome::Done(result) => Slot::Done(result),
                        Outcome::NotConfigured => Slot::NotConfigured,
                        Outcome::Failed(reason) => Slot::Failed(reason),
                    }
                };
                if slots[index].replace(slot).is_none() {
                    remaining -= 1;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    slots
        .into_iter()
        .map(|slot| slot.unwrap_or(Slot::TimedOut))
        .collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::error::{OrchestratorError, Result};
    use crossbeam_channel::{bounded, unbounded};
    use std::sync::Barrier;
    use std::sync::atomic::AtomicUsize;

    /// Collector returning fixed output.
    struct Fixed {
        name: &'static str,
        alerts: Vec<&'static str>,
        stat: Option<&'static str>,
        delay: Duration,
    }

    impl Fixed {
        fn new(name: &'static str, alerts: Vec<&'static str>, stat: Option<&'static str>) -> Self {
            Self {
                name,
                alerts,
                stat,
                delay: Duration::ZERO,
            }
        }

        fn delayed(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    impl Collector for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        fn is_configured(&self) -> bool {
            true
        }

        fn alerts(&self) -> Result<Vec<String>> {
            std::thread::sleep(self.delay);
            Ok(self.alerts.iter().map(|a| (*a).to_owned()).collect())
        }

        fn stat_line(&self) -> Result<Option<String>> {
            Ok(self.stat.map(str::to_owned))
        }
    }

    struct Failing;

    impl Collector for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn is_configured(&self) -> bool {
            true
        }

        fn alerts(&self) -> Result<Vec<String>> {
            Err(OrchestratorError::Collector("401 unauthorized".to_owned()))
        }
    }

    struct Panicking;

    impl Collector for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn is_configured(&self) -> bool {
            true
        }

        fn alerts(&self) -> Result<Vec<String>> {
            panic!("collector bug");
        }
    }

    struct Unconfigured {
        calls: AtomicUsize,
    }

    impl Collector for Unconfigured {
        fn name(&self) -> &str {
            "unconfigured"
        }

        fn is_configured(&self) -> bool {
            false
        }

        fn alerts(&self) -> Result<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec!["should not appear".to_owned()])
        }
    }

    /// Blocks inside `alerts` until the test drops the release sender.
    struct Gate {
        calls: AtomicUsize,
        entered: Sender<()>,
        release: Receiver<()>,
    }

    impl Collector for Gate {
        fn name(&self) -> &str {
            "gate"
        }

        fn is_configured(&self) -> bool {
            true
        }

        fn alerts(&self) -> Result<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.entered.send(());
            let _ = self.release.recv();
            Ok(vec!["gate opened".to_owned()])
        }
    }

    fn fast_config() -> AggregatorConfig {
        AggregatorConfig {
            collector_timeout_ms: 200,
            total_timeout_ms: 2_000,
            min_workers: 4,
        }
    }

    #[test]
    fn concurrent_requests_run_exactly_one_refresh() {
        let (entered_tx, entered_rx) = unbounded();
        let (release_tx, release_rx) = bounded::<()>(0);
        let gate = Arc::new(Gate {
            calls: AtomicUsize::new(0),
            entered: entered_tx,
            release: release_rx,
        });
        let config = AggregatorConfig {
            collector_timeout_ms: 10_000,
            total_timeout_ms: 10_000,
            min_workers: 4,
        };
        let aggregator = StatusAggregator::builder(config)
            .with_plugin(gate.clone())
            .build();

        let handle = aggregator.request_refresh().expect("first request starts");
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(aggregator.is_refreshing());

        let barrier = Arc::new(Barrier::new(8));
        let rejected: usize = (0..8)
            .map(|_| {
                let aggregator = aggregator.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    aggregator.request_refresh().is_none()
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();
        assert_eq!(rejected, 8);

        drop(release_tx);
        let report = handle.wait();
        assert_eq!(report.succeeded, ["gate"]);
        assert_eq!(gate.calls.load(Ordering::SeqCst), 1);
        assert!(!aggregator.is_refreshing());
        assert_eq!(aggregator.stats().skipped_requests, 8);
        assert_eq!(aggregator.current_snapshot().alerts(), ["gate opened"]);

        // The guard is released, so the next request is accepted.
        assert!(aggregator.refresh_blocking().is_some());
    }

    #[test]
    fn dropped_refresh_handle_still_publishes() {
        let (entered_tx, entered_rx) = unbounded();
        let (release_tx, release_rx) = bounded::<()>(0);
        let config = AggregatorConfig {
            collector_timeout_ms: 10_000,
            total_timeout_ms: 10_000,
            min_workers: 4,
        };
        let aggregator = StatusAggregator::builder(config)
            .with_plugin(Arc::new(Gate {
                calls: AtomicUsize::new(0),
                entered: entered_tx,
                release: release_rx,
            }))
            .build();

        // Returns while the collector is still blocked.
        drop(aggregator.request_refresh().expect("request accepted"));
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(aggregator.is_refreshing());
        assert!(aggregator.current_snapshot().is_empty());

        drop(release_tx);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while aggregator.is_refreshing() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!aggregator.is_refreshing());
        assert_eq!(aggregator.current_snapshot().alerts(), ["gate opened"]);
    }

    #[test]
    fn failed_panicked_and_slow_collectors_contribute_nothing() {
        let (_hold, never) = bounded::<()>(0);
        let (entered_tx, _entered_rx) = unbounded();
        let stuck = Arc::new(Gate {
            calls: AtomicUsize::new(0),
            entered: entered_tx,
            release: never,
        });

        let aggregator = StatusAggregator::builder(fast_config())
            .with_plugin(Arc::new(Fixed::new("plex", vec!["Plex: 1 transcode"], Some("Plex: 2 streams"))))
            .with_plugin(Arc::new(Failing))
            .with_plugin(Arc::new(Panicking))
            .with_plugin(stuck)
            .with_plugin(Arc::new(
                Fixed::new("late", vec!["late alert"], Some("late stat"))
                    .delayed(Duration::from_millis(400)),
            ))
            .build();

        let report = aggregator.refresh_blocking().unwrap();
        let snapshot = aggregator.current_snapshot();

        assert_eq!(snapshot.alerts(), ["Plex: 1 transcode"]);
        assert_eq!(snapshot.stats(), ["Plex: 2 streams"]);
        assert_eq!(report.succeeded, ["plex"]);
        assert_eq!(report.degraded, ["failing"]);
        assert_eq!(report.failed, ["panicking"]);
        assert_eq!(report.timed_out, ["gate", "late"]);

        let stats = aggregator.stats();
        assert_eq!(stats.refreshes, 1);
        assert_eq!(stats.collector_failures, 1);
        assert_eq!(stats.call_failures, 1);
        assert_eq!(stats.collector_timeouts, 2);
    }

    #[test]
    fn failing_alerts_call_keeps_the_stat_line() {
        struct Unauthorized;

        impl Collector for Unauthorized {
            fn name(&self) -> &str {
                "plex"
            }

            fn is_configured(&self) -> bool {
                true
            }

            fn alerts(&self) -> Result<Vec<String>> {
                Err(OrchestratorError::Collector("401 unauthorized".to_owned()))
            }

            fn stat_line(&self) -> Result<Option<String>> {
                Ok(Some("Plex: 2 streams".to_owned()))
            }
        }

        let aggregator = StatusAggregator::builder(AggregatorConfig::default())
            .with_plugin(Arc::new(Unauthorized))
            .build();

        let report = aggregator.refresh_blocking().unwrap();
        assert!(report.failed.is_empty());
        assert_eq!(report.degraded, ["plex"]);
        assert_eq!(aggregator.current_snapshot().stats(), ["Plex: 2 streams"]);
        assert!(aggregator.current_snapshot().alerts().is_empty());
        assert_eq!(aggregator.stats().call_failures, 1);
        assert_eq!(aggregator.stats().collector_failures, 0);
    }

    #[test]
    fn total_deadline_bounds_the_refresh() {
        let (_hold, never) = bounded::<()>(0);
        let (entered_tx, _entered_rx) = unbounded();
        let config = AggregatorConfig {
            collector_timeout_ms: 60_000,
            total_timeout_ms: 150,
            min_workers: 1,
        };
        let aggregator = StatusAggregator::builder(config)
            .with_plugin(Arc::new(Gate {
                calls: AtomicUsize::new(0),
                entered: entered_tx,
                release: never,
            }))
            .with_plugin(Arc::new(Fixed::new("quick", Vec::new(), Some("quick: ok"))))
            .build();

        let report = aggregator.refresh_blocking().unwrap();
        assert!(report.duration < Duration::from_secs(5));
        assert_eq!(report.timed_out, ["gate"]);
        assert_eq!(aggregator.current_snapshot().stats(), ["quick: ok"]);
    }

    #[test]
    fn presentation_order_ignores_completion_order() {
        let aggregator = StatusAggregator::builder(fast_config())
            .with_plugin(Arc::new(
                Fixed::new("first", vec!["first alert"], Some("first stat"))
                    .delayed(Duration::from_millis(60)),
            ))
            .with_plugin(Arc::new(
                Fixed::new("second", vec!["second alert"], Some("second stat"))
                    .delayed(Duration::from_millis(30)),
            ))
            .with_health_collector(Arc::new(Fixed::new("health", vec!["Disk warning"], Some("ignored"))))
            .with_connectivity_collector(Arc::new(Fixed::new("connectivity", vec!["SSH: nas unreachable"], None)))
            .build();

        aggregator.refresh_blocking().unwrap();
        let snapshot = aggregator.current_snapshot();

        assert_eq!(
            snapshot.alerts(),
            ["first alert", "second alert", "Disk warning", "SSH: nas unreachable"]
        );
        assert_eq!(snapshot.stats(), ["first stat", "second stat"]);
    }

    #[test]
    fn unconfigured_collectors_are_skipped() {
        let unconfigured = Arc::new(Unconfigured {
            calls: AtomicUsize::new(0),
        });
        let aggregator = StatusAggregator::builder(fast_config())
            .with_plugin(unconfigured.clone())
            .build();

        let report = aggregator.refresh_blocking().unwrap();
        assert_eq!(report.skipped, ["unconfigured"]);
        assert_eq!(unconfigured.calls.load(Ordering::SeqCst), 0);
        assert!(aggregator.current_snapshot().is_empty());
    }

    #[test]
    fn snapshot_swap_is_atomic_for_readers() {
        /// Every line of one refresh carries the same generation number.
        struct Generational {
            generation: AtomicUsize,
        }

        impl Collector for Generational {
            fn name(&self) -> &str {
                "generational"
            }

            fn is_configured(&self) -> bool {
                true
            }

            fn alerts(&self) -> Result<Vec<String>> {
                let g = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                Ok((0..5).map(|i| format!("gen-{g} alert-{i}")).collect())
            }

            fn stat_line(&self) -> Result<Option<String>> {
                let g = self.generation.load(Ordering::SeqCst);
                Ok(Some(format!("gen-{g} stat")))
            }
        }

        fn generation_of(line: &str) -> &str {
            line.split_whitespace().next().unwrap_or_default()
        }

        let aggregator = StatusAggregator::builder(fast_config())
            .with_plugin(Arc::new(Generational {
                generation: AtomicUsize::new(0),
            }))
            .build();

        let done = Arc::new(AtomicBool::new(false));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let aggregator = aggregator.clone();
                let done = Arc::clone(&done);
                std::thread::spawn(move || {
                    let mut reads = 0_u64;
                    while !done.load(Ordering::Acquire) {
                        let snapshot = aggregator.current_snapshot();
                        if snapshot.is_empty() {
                            continue;
                        }
                        let generation = generation_of(&snapshot.stats()[0]).to_owned();
                        assert_eq!(snapshot.alerts().len(), 5);
                        assert!(
                            snapshot
                                .alerts()
                                .iter()
                                .all(|a| generation_of(a) == generation)
                        );
                        reads += 1;
                    }
                    reads
                })
            })
            .collect();

        for _ in 0..25 {
            aggregator.refresh_blocking().unwrap();
        }
        done.store(true, Ordering::Release);

        for reader in readers {
            reader.join().expect("reader saw a torn snapshot");
        }
        assert_eq!(aggregator.stats().refreshes, 25);
    }

    #[test]
    fn persist_failure_is_counted_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "file").unwrap();

        let aggregator = StatusAggregator::builder(fast_config())
            .with_plugin(Arc::new(Fixed::new("plex", Vec::new(), Some("Plex: idle"))))
            .with_cache(SnapshotCache::new(blocker.join("header_cache.json")))
            .build();

        let report = aggregator.refresh_blocking().unwrap();
        assert!(!report.persisted);
        assert_eq!(aggregator.stats().persist_failures, 1);
        assert_eq!(aggregator.current_snapshot().stats(), ["Plex: idle"]);
    }

    #[test]
    fn cached_stats_restore_only_before_first_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("header_cache.json");

        let first = StatusAggregator::builder(fast_config())
            .with_plugin(Arc::new(Fixed::new("plex", vec!["alert"], Some("Plex: 2 streams"))))
            .with_cache(SnapshotCache::new(&path))
            .build();
        assert!(first.refresh_blocking().unwrap().persisted);

        let second = StatusAggregator::builder(fast_config())
            .with_plugin(Arc::new(Fixed::new("plex", Vec::new(), Some("Plex: idle"))))
            .with_cache(SnapshotCache::new(&path))
            .build();
        assert!(second.restore_cached());
        let restored = second.current_snapshot();
        assert_eq!(restored.stats(), ["Plex: 2 streams"]);
        assert!(restored.alerts().is_empty());

        second.refresh_blocking().unwrap();
        assert!(!second.restore_cached());
        assert_eq!(second.current_snapshot().stats(), ["Plex: idle"]);
    }

    #[test]
    fn refresh_with_no_collectors_publishes_empty_snapshot() {
        let aggregator = StatusAggregator::builder(fast_config()).build();
        let report = aggregator.refresh_blocking().unwrap();
        assert_eq!(report, RefreshReport {
            duration: report.duration,
            ..RefreshReport::default()
        });
        assert!(aggregator.current_snapshot().is_empty());
        assert_ne!(aggregator.current_snapshot().generated_at(), chrono::DateTime::<Utc>::UNIX_EPOCH);
    }
}
