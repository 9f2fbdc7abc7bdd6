//! Immutable refresh snapshot and its on-disk cache.

use crate::error::Result;
use crate::settings::write_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Aggregated dashboard view produced by one refresh cycle.
///
/// Never mutated after construction; readers share it through an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshSnapshot {
    alerts: Vec<String>,
    stats: Vec<String>,
    generated_at: DateTime<Utc>,
}

impl RefreshSnapshot {
    /// Build a snapshot stamped with `generated_at`.
    pub fn new(alerts: Vec<String>, stats: Vec<String>, generated_at: DateTime<Utc>) -> Self {
        Self {
            alerts,
            stats,
            generated_at,
        }
    }

    /// Placeholder used before the first refresh or cache restore.
    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new(), DateTime::<Utc>::UNIX_EPOCH)
    }

    pub fn alerts(&self) -> &[String] {
        &self.alerts
    }

    pub fn stats(&self) -> &[String] {
        &self.stats
    }

    pub fn generated_at(&self) -> DateTime<Utc> {
        self.generated_at
    }

    /// Returns `true` when neither alerts nor stats are present.
    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty() && self.stats.is_empty()
    }
}

impl Default for RefreshSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

/// On-disk shape of `header_cache.json`.
#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    #[serde(default)]
    plugin_stats: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    generated_at: Option<DateTime<Utc>>,
}

/// Persists the stat lines of a snapshot across restarts.
///
/// Alerts are deliberately not cached: they go stale quickly.
#[derive(Debug, Clone)]
pub struct SnapshotCache {
    path: PathBuf,
}

impl SnapshotCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the cached snapshot. A missing file yields `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(&self) -> Result<Option<RefreshSnapshot>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let cache: CacheFile = serde_json::from_slice(&bytes)?;
        Ok(Some(RefreshSnapshot::new(
            Vec::new(),
            cache.plugin_stats,
            cache.generated_at.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        )))
    }

    /// Write the snapshot's stat lines atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the atomic write fails.
    pub fn save(&self, snapshot: &RefreshSnapshot) -> Result<()> {
        let cache = CacheFile {
            plugin_stats: snapshot.stats.clone(),
            generated_at: Some(snapshot.generated_at),
        };
        let json = serde_json::to_string_pretty(&cache)?;
        write_atomic(&self.path, json.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn save_then_load_keeps_stats_only() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SnapshotCache::new(dir.path().join("header_cache.json"));
        let at = Utc::now();
        let snapshot = RefreshSnapshot::new(
            vec!["Plex unreachable".to_owned()],
            vec!["Plex: 2 streams".to_owned(), "Sonarr: 3 queued".to_owned()],
            at,
        );

        cache.save(&snapshot).unwrap();
        let loaded = cache.load().unwrap().unwrap();

        assert!(loaded.alerts().is_empty());
        assert_eq!(loaded.stats(), snapshot.stats());
        assert_eq!(loaded.generated_at(), at);
    }

    #[test]
    fn missing_cache_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SnapshotCache::new(dir.path().join("absent.json"));
        assert!(cache.load().unwrap().is_none());
    }

    #[test]
    fn legacy_cache_without_timestamp_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("header_cache.json");
        std::fs::write(&path, r#"{"plugin_stats": ["UniFi: 14 clients"]}"#).unwrap();

        let loaded = SnapshotCache::new(&path).load().unwrap().unwrap();
        assert_eq!(loaded.stats(), ["UniFi: 14 clients"]);
        assert_eq!(loaded.generated_at(), DateTime::<Utc>::UNIX_EPOCH);
    }

    #[test]
    fn corrupt_cache_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("header_cache.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(SnapshotCache::new(&path).load().is_err());
    }

    #[test]
    fn empty_snapshot_is_empty() {
        assert!(RefreshSnapshot::empty().is_empty());
        assert_eq!(RefreshSnapshot::default(), RefreshSnapshot::empty());
    }
}
