//! Headless orchestration daemon.
//!
//! Wires the status aggregator, the task scheduler and the transfer queue to
//! the real collaborators (ssh, rsync, desktop/Discord notifications) and
//! drives them from line commands on stdin:
//!
//! ```text
//! refresh                      start a status refresh in the background
//! status                       print the current snapshot
//! tasks                        list scheduled tasks
//! add <kind> <secs>            add a scheduled task
//! run <task-id>                run a task now
//! send <src> <dest> [host]     queue a transfer
//! queue                        show pending and finished transfers
//! quit                         shut down (EOF works too)
//! ```
//!
//! Every handled command also requests a background refresh so the snapshot
//! follows the change; a refresh already in flight absorbs the request.
//!
//! Diagnostics go to stderr and to a daily log file in the logs directory.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use homelab_core::collector::UreqProbe;
use homelab_core::notify::Notifier;
use homelab_core::scheduler::{
    CollectorTaskHandler, ConfigBackupHandler, UpdateCheckHandler, format_interval,
};
use homelab_core::{
    Collector, ConfigStore, ConnectivityCollector, HandlerRegistry, HealthCheckCollector,
    JsonFileStore, MultiNotifier, OrchestratorConfig, RefreshSnapshot, RemoteShell,
    RsyncTransport, Scheduler, SnapshotCache, SshShell, StatusAggregator, TaskKind, TransferJob,
    TransferQueue, homelab_dirs,
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

struct Args {
    config: PathBuf,
    settings: PathBuf,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        config: homelab_dirs::config_file(),
        settings: homelab_dirs::settings_file(),
    };
    let mut argv = std::env::args().skip(1);
    while let Some(arg) = argv.next() {
        match arg.as_str() {
            "--config" => {
                args.config = argv.next().context("--config needs a path")?.into();
            }
            "--settings" => {
                args.settings = argv.next().context("--settings needs a path")?.into();
            }
            "-h" | "--help" => {
                println!("usage: homelabd [--config PATH] [--settings PATH]");
                std::process::exit(0);
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(args)
}

/// Stderr plus a daily rolling file. The guard must outlive `main`'s work so
/// buffered file output is flushed on exit.
fn init_logging() -> WorkerGuard {
    let file_appender = tracing_appender::rolling::daily(homelab_dirs::logs_dir(), "homelabd.log");
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("homelab_core=info,homelabd=info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking_file)
                .with_ansi(false),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    guard
}

fn print_snapshot(snapshot: &RefreshSnapshot) {
    if snapshot.is_empty() {
        println!("no status yet");
        return;
    }
    println!("as of {}", snapshot.generated_at().format("%Y-%m-%d %H:%M:%S UTC"));
    for stat in snapshot.stats() {
        println!("  {stat}");
    }
    if snapshot.alerts().is_empty() {
        println!("  all clear");
    }
    for alert in snapshot.alerts() {
        println!("  ! {alert}");
    }
}

fn parse_kind(name: &str) -> Option<TaskKind> {
    serde_json::from_value(serde_json::Value::String(name.to_owned())).ok()
}

fn main() -> anyhow::Result<()> {
    let args = parse_args()?;
    let _guard = init_logging();

    let config = OrchestratorConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let settings: Arc<dyn ConfigStore> = Arc::new(
        JsonFileStore::open(&args.settings)
            .with_context(|| format!("opening {}", args.settings.display()))?,
    );
    tracing::info!(config = %args.config.display(), "homelabd starting");

    let shell: Arc<dyn RemoteShell> = Arc::new(SshShell::new());
    let notifier: Arc<dyn Notifier> = Arc::new(MultiNotifier::from_config(&config.notifications));
    let budget = config.aggregator.check_budget();
    let health: Arc<dyn Collector> = Arc::new(
        HealthCheckCollector::new(
            Arc::clone(&settings),
            Arc::clone(&shell),
            Arc::new(UreqProbe::default()),
        )
        .with_budget(budget),
    );
    let connectivity: Arc<dyn Collector> = Arc::new(
        ConnectivityCollector::new(Arc::clone(&settings), Arc::clone(&shell)).with_budget(budget),
    );

    let aggregator = StatusAggregator::builder(config.aggregator.clone())
        .with_health_collector(Arc::clone(&health))
        .with_connectivity_collector(Arc::clone(&connectivity))
        .with_cache(SnapshotCache::new(homelab_dirs::header_cache_file()))
        .build();
    aggregator.restore_cached();

    let handlers = HandlerRegistry::new()
        .with(TaskKind::HealthCheck, CollectorTaskHandler::new(health))
        .with(TaskKind::ConnectivityTest, CollectorTaskHandler::new(connectivity))
        .with(
            TaskKind::ConfigBackup,
            ConfigBackupHandler::new(Arc::clone(&settings), homelab_dirs::backups_dir()),
        )
        .with(
            TaskKind::UpdateCheck,
            UpdateCheckHandler::new(Arc::clone(&settings), Arc::clone(&shell)),
        );
    let scheduler = Scheduler::new(config.scheduler.clone(), Arc::clone(&settings), handlers);
    scheduler.start();

    let transfers = TransferQueue::new(
        config.transfers.clone(),
        Arc::new(RsyncTransport::new().with_dry_run(config.transfers.dry_run)),
        notifier,
    );

    // Warm the snapshot in the background; commands can run meanwhile.
    let _ = aggregator.request_refresh();

    for line in std::io::stdin().lock().lines() {
        let line = line.context("reading stdin")?;
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            [] => continue,
            ["quit"] | ["exit"] => break,
            ["refresh"] => {
                if aggregator.request_refresh().is_some() {
                    println!("refresh started");
                } else {
                    println!("refresh already running");
                }
                continue;
            }
            ["status"] => print_snapshot(&aggregator.current_snapshot()),
            ["tasks"] => {
                for task in scheduler.tasks() {
                    println!(
                        "{}  {:<26} every {:<4} {} runs={} last={}",
                        task.id,
                        task.kind.label(),
                        format_interval(task.interval_secs),
                        if task.enabled { "on " } else { "off" },
                        task.run_count,
                        task.last_run.as_deref().unwrap_or("never")
                    );
                }
            }
            ["add", kind, secs] => {
                let Some(kind) = parse_kind(kind) else {
                    println!("unknown task kind: {kind}");
                    continue;
                };
                match secs.parse::<u64>().map_err(anyhow::Error::from).and_then(|secs| {
                    scheduler.add_task(kind, secs).map_err(anyhow::Error::from)
                }) {
                    Ok(task) => println!("added {}", task.id),
                    Err(e) => println!("cannot add task: {e}"),
                }
            }
            ["run", id] => match scheduler.run_now(id) {
                Ok(record) => println!("{:?}: {}", record.outcome, record.summary),
                Err(e) => println!("{e}"),
            },
            ["send", src, dest, rest @ ..] => {
                let mut job = TransferJob::new(*src, *dest)
                    .directory(std::path::Path::new(src).is_dir());
                if let Some(host) = rest.first() {
                    job = job.to_host(*host, None);
                }
                println!("queued {}", transfers.enqueue(job));
            }
            ["queue"] => {
                if let Some(job) = transfers.in_flight() {
                    println!("  > {} -> {}", job.basename(), job.destination_spec());
                }
                for job in transfers.pending() {
                    println!("  . {} -> {}", job.basename(), job.destination_spec());
                }
                for job in transfers.history() {
                    println!(
                        "  {:?} {} {}",
                        job.status,
                        job.basename(),
                        job.error.as_deref().or(job.summary.as_deref()).unwrap_or("")
                    );
                }
            }
            _ => {
                println!("unrecognised command: {line}");
                continue;
            }
        }
        // A command may have changed what the dashboard shows. The refresh
        // runs on its own thread; a dropped handle does not cancel it.
        let _ = aggregator.request_refresh();
    }

    tracing::info!("homelabd shutting down");
    scheduler.stop();
    transfers.stop_worker();
    scheduler.join();
    transfers.join_worker();
    tracing::info!("homelabd shut down cleanly");
    Ok(())
}
