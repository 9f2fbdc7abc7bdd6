//! homelab-core: background orchestration for the homelab dashboard.
//!
//! Three independent components run alongside the interactive UI:
//!
//! - **Status aggregation**: [`StatusAggregator`] fans out to every
//!   [`Collector`] on a bounded thread pool under per-collector and
//!   per-refresh timeouts, then atomically swaps in a new
//!   [`RefreshSnapshot`]. Only one refresh runs at a time.
//! - **Task scheduling**: [`Scheduler`] keeps a persisted list of recurring
//!   tasks and runs the due ones, strictly one after another.
//! - **Transfer queueing**: [`TransferQueue`] is a FIFO of rsync/scp jobs
//!   drained by a single lazily started worker.
//!
//! Collaborators (settings store, remote shell, transport, notifier) are
//! traits so every component can be exercised without a network.

pub mod aggregator;
pub mod collector;
pub mod config;
pub mod error;
pub mod homelab_dirs;
pub mod notify;
pub mod scheduler;
pub mod settings;
pub mod shell;
pub mod transfer;

pub use aggregator::{
    AggregatorStats, RefreshHandle, RefreshReport, RefreshSnapshot, SnapshotCache,
    StatusAggregator,
};
pub use collector::{Collector, CollectorResult, ConnectivityCollector, HealthCheckCollector};
pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, Result};
pub use notify::{MultiNotifier, Notifier};
pub use scheduler::{
    HandlerRegistry, ScheduledTask, Scheduler, TaskHandler, TaskKind, UpdateCheckHandler,
};
pub use settings::{ConfigStore, JsonFileStore, MemoryStore};
pub use shell::{RemoteShell, SshShell};
pub use transfer::{RsyncTransport, TransferJob, TransferQueue, TransferStatus, Transport};
