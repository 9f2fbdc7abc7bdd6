//! Transfer job record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Lifecycle state of a [`TransferJob`]. `Success` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Success,
    Failed,
}

/// A single queued file or directory transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferJob {
    pub id: String,
    /// Local source path.
    pub source: String,
    /// Remote destination. When `host` is set this is a path on that host,
    /// otherwise a complete `host:path` spec.
    pub destination: String,
    pub is_dir: bool,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub status: TransferStatus,
    pub enqueued_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure reason for `Failed` jobs.
    pub error: Option<String>,
    /// Size and throughput reported by the transport, when available.
    pub summary: Option<String>,
}

impl TransferJob {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source: source.into(),
            destination: destination.into(),
            is_dir: false,
            host: None,
            port: None,
            status: TransferStatus::Pending,
            enqueued_at: Utc::now(),
            finished_at: None,
            error: None,
            summary: None,
        }
    }

    /// Mark the source as a directory (recursive copy).
    pub fn directory(mut self, is_dir: bool) -> Self {
        self.is_dir = is_dir;
        self
    }

    /// Send to `host`, optionally on a non-default SSH port.
    pub fn to_host(mut self, host: impl Into<String>, port: Option<u16>) -> Self {
        self.host = Some(host.into());
        self.port = port;
        self
    }

    /// The `host:path` argument handed to rsync or scp.
    pub fn destination_spec(&self) -> String {
        match self.host.as_deref().map(str::trim) {
            Some(host) if !host.is_empty() => format!("{host}:{}", self.destination),
            _ => self.destination.clone(),
        }
    }

    /// Final path component of the source, for display.
    pub fn basename(&self) -> String {
        Path::new(&self.source)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.source.clone())
    }

    pub fn is_finished(&self) -> bool {
        self.status != TransferStatus::Pending
    }

    pub(crate) fn finish(
        &mut self,
        status: TransferStatus,
        error: Option<String>,
        summary: Option<String>,
    ) {
        self.status = status;
        self.error = error;
        self.summary = summary;
        self.finished_at = Some(Utc::now());
    }
}
