//! Status collectors.
//!
//! A [`Collector`] gathers dashboard alerts and a one-line stat from a single
//! source. Every call is treated as untrusted: it may fail, panic, or hang,
//! so the aggregator only ever invokes collectors from its worker pool.

pub mod connectivity;
pub mod health;
pub mod tls;

pub use connectivity::{ConnectivityCollector, DockerServer, docker_servers};
pub use health::{HealthCheckCollector, HttpProbe, UreqProbe};
pub use tls::{CertInspector, TlsCertInspector};

use crate::error::Result;
use crossbeam_channel::unbounded;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Default share of the collector timeout a built-in collector may spend on
/// its own checks.
pub const DEFAULT_CHECK_BUDGET: Duration = Duration::from_secs(7);

/// A status source.
pub trait Collector: Send + Sync {
    /// Short, stable name used in logs and refresh reports.
    fn name(&self) -> &str;

    /// Returns `true` when the source has the settings it needs.
    fn is_configured(&self) -> bool;

    /// Alert strings for the dashboard header (e.g. down monitors).
    ///
    /// # Errors
    ///
    /// Returns an error if the source could not be queried.
    fn alerts(&self) -> Result<Vec<String>>;

    /// One-line stat for the dashboard header, if the source has one.
    ///
    /// # Errors
    ///
    /// Returns an error if the source could not be queried.
    fn stat_line(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Per-source payload produced during one refresh cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectorResult {
    /// Alerts raised by the source. Empty when the alerts call failed.
    pub alerts: Vec<String>,
    /// Optional stat line. `None` when the stat call failed.
    pub stat: Option<String>,
    /// Messages from calls that returned an error.
    pub errors: Vec<String>,
}

impl CollectorResult {
    /// Returns `true` when at least one call failed.
    pub fn is_degraded(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Run both collector calls and merge them into a [`CollectorResult`].
///
/// The calls are independent: a failing `alerts()` counts as no alerts and a
/// failing `stat_line()` as no stat, and each failure is kept in
/// [`CollectorResult::errors`].
pub fn collect(collector: &dyn Collector) -> CollectorResult {
    let mut result = CollectorResult::default();
    match collector.alerts() {
        Ok(alerts) => result.alerts = alerts,
        Err(e) => result.errors.push(format!("alerts: {e}")),
    }
    match collector.stat_line() {
        Ok(stat) => result.stat = stat.filter(|line| !line.trim().is_empty()),
        Err(e) => result.errors.push(format!("stat: {e}")),
    }
    result
}

/// Run `check` on every item concurrently, one named thread per item, and
/// wait until `deadline`.
///
/// Results come back in input order. An item whose check has not finished
/// by the deadline, or that panicked, yields `None`; its thread is left to
/// finish on its own.
pub(crate) fn fan_out<T, R, F>(items: Vec<T>, deadline: Instant, check: F) -> Vec<Option<R>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> R + Send + Sync + 'static,
{
    let mut results: Vec<Option<R>> = items.iter().map(|_| None).collect();
    if items.is_empty() {
        return results;
    }

    let check = Arc::new(check);
    let (tx, rx) = unbounded::<(usize, R)>();
    for (index, item) in items.into_iter().enumerate() {
        let tx = tx.clone();
        let check = Arc::clone(&check);
        let spawned = std::thread::Builder::new()
            .name("homelab-check".to_owned())
            .spawn(move || {
                let _ = tx.send((index, check(item)));
            });
        if let Err(e) = spawned {
            warn!("failed to spawn check thread: {e}");
        }
    }
    drop(tx);

    let mut pending = results.len();
    while pending > 0 {
        match rx.recv_deadline(deadline) {
            Ok((index, result)) => {
                results[index] = Some(result);
                pending -= 1;
            }
            // Deadline passed, or every remaining thread is gone.
            Err(_) => break,
        }
    }
    results
}
