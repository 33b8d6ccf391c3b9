//! File-backed counter store
//!
//! Keeps a flat JSON object of `key -> u64` on disk. Every write rewrites the whole
//! file through a temporary sibling and a rename, so a power cut mid-write leaves
//! either the old or the new contents.

use super::CounterStore;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to access state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to encode state: {0}")]
    Encode(#[from] serde_json::Error),
}

pub struct FileStore {
    path: PathBuf,
    values: BTreeMap<String, u64>,
}

impl FileStore {
    /// Open the store at `path`, starting empty if the file is missing.
    ///
    /// A corrupt file is treated like a missing one: the values it held are lost,
    /// which at worst resets the restart backoff to its initial delay.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let values = match fs::read(&path) {
            Ok(content) => match serde_json::from_slice(&content) {
                Ok(values) => values,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring corrupt state file");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        debug!(path = %path.display(), entries = values.len(), "Opened state file");
        Ok(Self { path, values })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<(), StoreError> {
        let encoded = serde_json::to_vec_pretty(&self.values)?;
        let tmp = self.path.with_extension("tmp");
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        fs::write(&tmp, encoded).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)
    }
}

impl CounterStore for FileStore {
    fn read(&self, key: &str) -> Option<u64> {
        self.values.get(key).copied()
    }

    fn write(&mut self, key: &str, value: u64) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), value);
        self.persist()
    }

    fn clear(&mut self, key: &str) -> Result<(), StoreError> {
        if self.values.remove(key).is_some() {
            self.persist()?;
        }
        Ok(())
    }
}
