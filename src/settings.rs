//! User settings store.
//!
//! The settings store is the key/value collaborator the orchestration core
//! reads service endpoints from and persists the scheduled task list into.
//! [`JsonFileStore`] keeps the whole document cached in memory and writes it
//! atomically (temp file, fsync, rename) on [`ConfigStore::persist`].

use crate::error::{OrchestratorError, Result};
use serde_json::{Map, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

/// Key/value settings collaborator.
pub trait ConfigStore: Send + Sync {
    /// Returns the value stored under `key`, if any.
    fn get(&self, key: &str) -> Option<Value>;

    /// Stores `value` under `key` in memory. Call [`persist`](Self::persist)
    /// to make it durable.
    fn set(&self, key: &str, value: Value);

    /// Flush the current settings to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing storage cannot be written.
    fn persist(&self) -> Result<()>;

    /// Returns the full settings document.
    fn export(&self) -> Value;

    /// Returns the value under `key`, or `default` when unset.
    fn get_or(&self, key: &str, default: Value) -> Value {
        self.get(key).unwrap_or(default)
    }

    /// Returns the non-empty string stored under `key`.
    fn get_str(&self, key: &str) -> Option<String> {
        match self.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
            _ => None,
        }
    }
}

/// Settings store backed by a JSON object file.
pub struct JsonFileStore {
    path: PathBuf,
    cache: RwLock<Map<String, Value>>,
}

impl JsonFileStore {
    /// Open the store at `path`. A missing file yields an empty store.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but is not a JSON object.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let map = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes)? {
                Value::Object(map) => map,
                _ => {
                    return Err(OrchestratorError::Config(format!(
                        "settings file {} is not a JSON object",
                        path.display()
                    )));
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            cache: RwLock::new(map),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: Value) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), value);
    }

    fn persist(&self) -> Result<()> {
        let json = {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            serde_json::to_string_pretty(&*cache)?
        };
        write_atomic(&self.path, json.as_bytes())
    }

    fn export(&self) -> Value {
        Value::Object(
            self.cache
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        )
    }
}

/// In-memory settings store. `persist` is a no-op.
#[derive(Default)]
pub struct MemoryStore {
    values: RwLock<Map<String, Value>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated from a JSON object. Non-object values
    /// yield an empty store.
    pub fn from_value(value: Value) -> Self {
        let values = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            values: RwLock::new(values),
        }
    }
}

impl ConfigStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: Value) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), value);
    }

    fn persist(&self) -> Result<()> {
        Ok(())
    }

    fn export(&self) -> Value {
        Value::Object(
            self.values
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        )
    }
}

/// Write `bytes` to `path` atomically (temp file, fsync, rename).
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            OrchestratorError::Persistence(format!(
                "cannot create directory {}: {e}",
                parent.display()
            ))
        })?;
    }

    let tmp_path = path.with_extension("tmp");
    let mut file = std::fs::File::create(&tmp_path).map_err(|e| {
        OrchestratorError::Persistence(format!(
            "cannot create temp file {}: {e}",
            tmp_path.display()
        ))
    })?;
    file.write_all(bytes)
        .map_err(|e| OrchestratorError::Persistence(format!("cannot write temp file: {e}")))?;
    file.sync_all()
        .map_err(|e| OrchestratorError::Persistence(format!("cannot sync temp file: {e}")))?;

    std::fs::rename(&tmp_path, path).map_err(|e| {
        OrchestratorError::Persistence(format!(
            "cannot rename {} to {}: {e}",
            tmp_path.display(),
            path.display()
        ))
    })
}
