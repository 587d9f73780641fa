use super::{RawStat, ReadStream, Readable, Writable, WriteStream};
use crate::hashing::sha256_hex;
use crate::DataError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;

pub(super) const SCHEME: &str = "file";

/// Files up to this size get a content hash in their metadata.
const HASH_LIMIT: u64 = 1024 * 1024;

/// Plain files on the local filesystem. Accepts `file://` references and
/// bare paths. `create` overwrites.
#[derive(Debug, Default)]
pub struct LocalProtocol;

impl LocalProtocol {
    pub fn new() -> Self {
        Self
    }

    pub fn path(reference: &str) -> PathBuf {
        PathBuf::from(reference.strip_prefix("file://").unwrap_or(reference))
    }
}

#[async_trait]
impl Readable for LocalProtocol {
    async fn exists(&self, reference: &str) -> Result<bool, DataError> {
        tokio::fs::try_exists(Self::path(reference))
            .await
            .map_err(|e| DataError::io(reference, e))
    }

    async fn open(&self, reference: &str) -> Result<ReadStream, DataError> {
        let file = tokio::fs::File::open(Self::path(reference))
            .await
            .map_err(|e| DataError::io(reference, e))?;
        Ok(Box::new(file))
    }

    async fn stat(&self, reference: &str) -> Result<RawStat, DataError> {
        let path = Self::path(reference);
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| DataError::io(reference, e))?;

        let last_modified = meta.modified().ok().map(DateTime::<Utc>::from);
        let content_hash = if meta.is_file() && meta.len() <= HASH_LIMIT {
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| DataError::io(reference, e))?;
            Some(sha256_hex(&bytes))
        } else {
            None
        };

        Ok(RawStat {
            content_length: Some(meta.len()),
            last_modified,
            content_hash,
        })
    }
}

#[async_trait]
impl Writable for LocalProtocol {
    async fn create(&self, reference: &str) -> Result<WriteStream, DataError> {
        let path = Self::path(reference);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DataError::io(reference, e))?;
        }
        let file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| DataError::io(reference, e))?;
        Ok(Box::new(file))
    }

    async fn delete(&self, reference: &str) -> Result<(), DataError> {
        tokio::fs::remove_file(Self::path(reference))
            .await
            .map_err(|e| DataError::io(reference, e))
    }
}
