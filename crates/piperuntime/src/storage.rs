//! Artifact store backends.
//!
//! The runtime builds one of these from `RuntimeConfig::storage_dir` and
//! hands it to every task through its context.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use pipecore::hashing::sha256_hex;
use pipecore::{DataError, DataFile, DataRegistry};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use pipecore::storage::{get_or_compute, ArtifactStore, StorageKey};

/// Fingerprint of a genome file from its reference and whatever metadata
/// the protocol can report.
pub async fn genome_fingerprint(file: &DataFile) -> Result<String, DataError> {
    let metadata = file.metadata().await?;
    let material = format!(
        "{}\n{}\n{}\n{}",
        file.reference(),
        metadata.content_length.map(|n| n.to_string()).unwrap_or_default(),
        metadata
            .last_modified
            .map(|t| t.to_rfc3339())
            .unwrap_or_default(),
        metadata.content_hash.unwrap_or_default(),
    );
    Ok(sha256_hex(material.as_bytes()))
}

/// In-process store.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, DataFile>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn get(&self, key: &StorageKey) -> Option<DataFile> {
        self.entries
            .get(&key.fingerprint())
            .map(|entry| entry.value().clone())
    }

    async fn put(&self, key: &StorageKey, file: &DataFile) {
        self.entries.insert(key.fingerprint(), file.clone());
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Record {
    key: StorageKey,
    reference: String,
    stored_at: DateTime<Utc>,
}

/// Store keeping one `<fingerprint>.json` record per key under `root`.
/// A record whose artifact no longer exists is a miss.
pub struct DirectoryStore {
    root: PathBuf,
    registry: Arc<DataRegistry>,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>, registry: Arc<DataRegistry>) -> Self {
        Self {
            root: root.into(),
            registry,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, key: &StorageKey) -> PathBuf {
        self.root.join(format!("{}.json", key.fingerprint()))
    }

    async fn read_record(&self, key: &StorageKey) -> Option<Record> {
        let path = self.record_path(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("Cannot read cache record {}: {}", path.display(), e);
                return None;
            }
        };
        match serde_json::from_slice::<Record>(&bytes) {
            Ok(record) if record.key == *key => Some(record),
            Ok(_) => {
                tracing::warn!("Cache record {} belongs to another key", path.display());
                None
            }
            Err(e) => {
                tracing::warn!("Corrupt cache record {}: {}", path.display(), e);
                None
            }
        }
    }
}

#[async_trait]
impl ArtifactStore for DirectoryStore {
    async fn get(&self, key: &StorageKey) -> Option<DataFile> {
        let record = self.read_record(key).await?;
        let file = match self.registry.resolve(&record.reference) {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!("Cached reference {} no longer resolves: {}", record.reference, e);
                return None;
            }
        };
        match file.exists().await {
            Ok(true) => Some(file),
            Ok(false) => None,
            Err(e) => {
                tracing::warn!("Cannot check cached artifact {}: {}", record.reference, e);
                None
            }
        }
    }

    async fn put(&self, key: &StorageKey, file: &DataFile) {
        let record = Record {
            key: key.clone(),
            reference: file.reference().to_string(),
            stored_at: Utc::now(),
        };
        let path = self.record_path(key);
        let outcome = async {
            tokio::fs::create_dir_all(&self.root).await?;
            let bytes = serde_json::to_vec_pretty(&record)?;
            tokio::fs::write(&path, bytes).await?;
            Ok::<_, pipecore::PipeError>(())
        }
        .await;
        if let Err(e) = outcome {
            tracing::warn!("Cannot write cache record {}: {}", path.display(), e);
        }
    }
}
