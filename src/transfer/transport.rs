//! File transport collaborator.
//!
//! [`RsyncTransport`] shells out to `rsync` over ssh and falls back to `scp`
//! when rsync is not installed.

use super::job::TransferJob;
use crate::error::{OrchestratorError, Result};
use std::process::{Command, Stdio};
use tracing::{debug, info};

/// Result of one transfer attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferOutcome {
    pub ok: bool,
    pub exit_code: Option<i32>,
    /// e.g. `"12.5 MB at 4.2 MB/s"`, parsed from rsync's `--stats` output.
    pub summary: Option<String>,
}

impl TransferOutcome {
    pub fn success() -> Self {
        Self {
            ok: true,
            exit_code: Some(0),
            summary: None,
        }
    }

    pub fn failure(exit_code: Option<i32>) -> Self {
        Self {
            ok: false,
            exit_code,
            summary: None,
        }
    }
}

/// Moves one job's data to its destination.
pub trait Transport: Send + Sync {
    /// Perform the transfer. Blocks until it finishes.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer tool could not be started. A tool
    /// that ran and failed is reported as `Ok` with `ok == false`.
    fn execute_transfer(&self, job: &TransferJob) -> Result<TransferOutcome>;
}

/// Copy tool used for a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyTool {
    Rsync,
    Scp,
}

impl CopyTool {
    fn binary(self) -> &'static str {
        match self {
            Self::Rsync => "rsync",
            Self::Scp => "scp",
        }
    }
}

/// rsync (or scp) over ssh.
#[derive(Debug, Clone, Default)]
pub struct RsyncTransport {
    dry_run: bool,
}

impl RsyncTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report every transfer as successful without running anything.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Arguments for `tool` (excluding the binary itself).
    pub fn build_args(tool: CopyTool, job: &TransferJob) -> Vec<String> {
        let mut args = Vec::new();
        match tool {
            CopyTool::Rsync => {
                let ssh = match job.port {
                    Some(port) => format!("ssh -p {port}"),
                    None => "ssh".to_owned(),
                };
                args.extend(["-ah".to_owned(), "--stats".to_owned(), "-e".to_owned(), ssh]);
            }
            CopyTool::Scp => {
                if let Some(port) = job.port {
                    args.push("-P".to_owned());
                    args.push(port.to_string());
                }
                if job.is_dir {
                    args.push("-r".to_owned());
                }
            }
        }
        args.push(job.source.clone());
        args.push(job.destination_spec());
        args
    }
}

impl Transport for RsyncTransport {
    fn execute_transfer(&self, job: &TransferJob) -> Result<TransferOutcome> {
        if self.dry_run {
            info!(source = %job.source, dest = %job.destination_spec(), "dry run, transfer skipped");
            return Ok(TransferOutcome::success());
        }

        let (tool, binary) = match which::which(CopyTool::Rsync.binary()) {
            Ok(path) => (CopyTool::Rsync, path),
            Err(_) => {
                let path = which::which(CopyTool::Scp.binary()).map_err(|e| {
                    OrchestratorError::Transfer(format!("neither rsync nor scp found: {e}"))
                })?;
                (CopyTool::Scp, path)
            }
        };

        let args = Self::build_args(tool, job);
        debug!(tool = tool.binary(), ?args, "starting transfer");
        let output = Command::new(binary)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                OrchestratorError::Transfer(format!("cannot spawn {}: {e}", tool.binary()))
            })?;

        if !output.status.success() {
            debug!(
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "transfer tool failed"
            );
            return Ok(TransferOutcome::failure(output.status.code()));
        }

        let mut outcome = TransferOutcome::success();
        if tool == CopyTool::Rsync {
            outcome.summary = parse_rsync_stats(&String::from_utf8_lossy(&output.stdout));
        }
        Ok(outcome)
    }
}

/// Extract bytes sent and throughput from rsync's closing stats line
/// (`sent 1,234 bytes  received 35 bytes  2,538.00 bytes/sec`).
pub fn parse_rsync_stats(output: &str) -> Option<String> {
    let line = output.lines().rev().find(|l| l.trim_start().starts_with("sent "))?;
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let number = |tok: &str| tok.replace(',', "").parse::<f64>().ok();

    let sent = number(tokens.get(1).copied()?)?;
    let rate_at = tokens.iter().position(|t| *t == "bytes/sec")?;
    let rate = number(tokens.get(rate_at.checked_sub(1)?).copied()?)?;

    let size = if sent > 1_000_000.0 {
        format!("{:.1} MB", sent / 1_000_000.0)
    } else {
        format!("{:.1} KB", sent / 1_000.0)
    };
    let speed = if rate > 1_000_000.0 {
        format!("{:.1} MB/s", rate / 1_000_000.0)
    } else {
        format!("{:.1} KB/s", rate / 1_000.0)
    };
    Some(format!("{size} at {speed}"))
}
