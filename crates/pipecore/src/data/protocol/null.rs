use super::{RawStat, ReadStream, Readable, SymbolicOnly, Writable, WriteStream};
use crate::DataError;
use async_trait::async_trait;

pub(super) const SCHEME: &str = "null";

/// Placeholder protocol: nothing exists and everything written is discarded.
#[derive(Debug, Default)]
pub struct NullProtocol;

impl NullProtocol {
    pub fn new() -> Self {
        Self
    }
}

impl SymbolicOnly for NullProtocol {}

#[async_trait]
impl Readable for NullProtocol {
    async fn exists(&self, _reference: &str) -> Result<bool, DataError> {
        Ok(false)
    }

    async fn open(&self, reference: &str) -> Result<ReadStream, DataError> {
        Err(DataError::NotFound(reference.to_string()))
    }

    async fn stat(&self, _reference: &str) -> Result<RawStat, DataError> {
        Ok(RawStat::default())
    }
}

#[async_trait]
impl Writable for NullProtocol {
    async fn create(&self, _reference: &str) -> Result<WriteStream, DataError> {
        Ok(Box::new(tokio::io::sink()))
    }

    async fn delete(&self, _reference: &str) -> Result<(), DataError> {
        Ok(())
    }
}
