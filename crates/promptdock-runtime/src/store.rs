//! Durable record store: one `<id>.json` file per runtime.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

use crate::models::Runtime;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to create store directory: {0}")]
    CreateDir(String),
    #[error("failed to write runtime record: {0}")]
    Write(String),
    #[error("failed to read runtime record: {0}")]
    Read(String),
    #[error("failed to decode runtime record: {0}")]
    Decode(String),
    #[error("failed to encode runtime record: {0}")]
    Encode(String),
}

/// Persists the serialisable fields of runtime records. Live handles
/// (interpreter, cancel, log buffer) are skipped by the record's serde shape.
#[derive(Clone)]
pub struct RecordStore {
    dir: PathBuf,
}

impl RecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub async fn save(&self, runtime: &Runtime) -> Result<(), StoreError> {
        let data =
            serde_json::to_vec_pretty(runtime).map_err(|e| StoreError::Encode(e.to_string()))?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StoreError::CreateDir(e.to_string()))?;
        tokio::fs::write(self.record_path(&runtime.id), data)
            .await
            .map_err(|e| StoreError::Write(e.to_string()))
    }

    pub async fn load(&self, id: &str) -> Result<Runtime, StoreError> {
        let data = tokio::fs::read(self.record_path(id))
            .await
            .map_err(|e| StoreError::Read(e.to_string()))?;
        serde_json::from_slice(&data).map_err(|e| StoreError::Decode(e.to_string()))
    }

    /// Read every `*.json` record in the store directory. Missing or
    /// malformed files are logged and skipped; a missing directory yields an
    /// empty set.
    pub async fn load_all(&self) -> Result<Vec<Runtime>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Read(e.to_string())),
        };

        let mut runtimes = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => return Err(StoreError::Read(e.to_string())),
            };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_record(&path).await {
                Ok(runtime) => runtimes.push(runtime),
                Err(e) => warn!(path = %path.display(), "skipping unreadable record: {e}"),
            }
        }
        Ok(runtimes)
    }
}

async fn read_record(path: &Path) -> Result<Runtime, StoreError> {
    let data = tokio::fs::read(path)
        .await
        .map_err(|e| StoreError::Read(e.to_string()))?;
    serde_json::from_slice(&data).map_err(|e| StoreError::Decode(e.to_string()))
}
