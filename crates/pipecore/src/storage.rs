//! Artifact cache contract.
//!
//! Expensive derived artifacts (indexes, dictionaries) are looked up by a
//! `StorageKey` before being rebuilt. A miss always computes locally and
//! stores the result; concurrent misses on the same key each compute.
//! Steps reach the configured store through `TaskContext::store`.

use crate::hashing::sha256_hex;
use crate::DataFile;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;

/// Identity of a cached artifact: the tool that produced it, the reference
/// genome it was built from and the tool's parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageKey {
    pub tool: String,
    pub genome_fingerprint: String,
    pub params: BTreeMap<String, String>,
}

impl StorageKey {
    pub fn new(tool: impl Into<String>, genome_fingerprint: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            genome_fingerprint: genome_fingerprint.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Hex SHA-256 of the key's canonical JSON. Field order is fixed and
    /// params are sorted, so equal keys always hash equally.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        sha256_hex(&canonical)
    }
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn get(&self, key: &StorageKey) -> Option<DataFile>;

    /// Record `file` under `key`. Failures are logged, never returned.
    async fn put(&self, key: &StorageKey, file: &DataFile);
}

/// Look `key` up in `store`, or compute the artifact and store it.
pub async fn get_or_compute<F, Fut, E>(store: &dyn ArtifactStore, key: &StorageKey, compute: F) -> Result<DataFile, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<DataFile, E>>,
{
    if let Some(file) = store.get(key).await {
        tracing::debug!("Artifact cache hit for {} ({})", key.tool, file.reference());
        return Ok(file);
    }

    tracing::debug!("Artifact cache miss for {}", key.tool);
    let file = compute().await?;
    store.put(key, &file).await;
    Ok(file)
}
