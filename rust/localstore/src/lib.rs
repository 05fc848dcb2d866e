//! Durable local JSON persistence for forecourt back-office services.
//!
//! Each key maps to one JSON file under a root directory. The contract is
//! deliberately small: `load` never fails (missing or unreadable data yields
//! the caller's default), `save` writes atomically, `remove` deletes the
//! backing file. Services use this as a durable mirror keyed by a string
//! namespace per collection, e.g. `config/connections` or
//! `legal/published_documents`.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// File-backed key/value store holding one JSON document per key.
#[derive(Debug, Clone)]
pub struct PersistentStorage {
    root: PathBuf,
}

impl PersistentStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Load the value stored under `key`, or `default` when the key is
    /// absent or its contents cannot be parsed. A corrupt mirror is logged
    /// and replaced by the default rather than surfaced as an error.
    pub fn load<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        let path = match self.path_for(key) {
            Ok(path) => path,
            Err(err) => {
                tracing::warn!(key, error = %err, "rejecting storage key");
                return default;
            }
        };

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return default,
            Err(err) => {
                tracing::warn!(key, error = %err, "failed to read local store file");
                return default;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(key, error = %err, "local store file is corrupt; using default");
                default
            }
        }
    }

    /// Persist `value` under `key`. The write is atomic: a temp file in the
    /// same directory is renamed over the target.
    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::Io {
                path: parent.display().to_string(),
                source: e,
            })?;
        }

        let bytes = serde_json::to_vec_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &bytes).map_err(|e| StoreError::Io {
            path: tmp.display().to_string(),
            source: e,
        })?;
        fs::rename(&tmp, &path).map_err(|e| StoreError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(())
    }

    /// Remove the value stored under `key`. Removing an absent key is not an
    /// error.
    pub fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::Io {
                path: path.display().to_string(),
                source: err,
            }),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        let relative = Path::new(key);
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                _ => return Err(StoreError::InvalidKey(key.to_string())),
            }
        }
        Ok(self.root.join(format!("{key}.json")))
    }
}
