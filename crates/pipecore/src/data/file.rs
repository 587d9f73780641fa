use super::protocol::{Capabilities, DataProtocol, DerivedProtocol, LocalProtocol, RawStat, ReadStream, WriteStream};
use super::DataRegistry;
use crate::{ConfigError, DataError, DataFormat};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Everything known about a stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub content_length: Option<u64>,
    pub content_type: String,
    pub content_encoding: String,
    pub data_format: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub content_hash: Option<String>,
}

/// A single reference resolved against a protocol.
///
/// Metadata is fetched once and cached; `create` and `delete` drop the
/// cached copy.
#[derive(Clone)]
pub struct DataFile {
    reference: String,
    protocol: Arc<DataProtocol>,
    registry: Arc<DataRegistry>,
    metadata: Arc<Mutex<Option<Metadata>>>,
}

impl DataFile {
    pub(crate) fn new(
        reference: impl Into<String>,
        protocol: Arc<DataProtocol>,
        registry: Arc<DataRegistry>,
    ) -> Self {
        Self {
            reference: reference.into(),
            protocol,
            registry,
            metadata: Arc::new(Mutex::new(None)),
        }
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn protocol(&self) -> &DataProtocol {
        &self.protocol
    }

    pub fn protocol_name(&self) -> &str {
        self.protocol.scheme()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.protocol.capabilities()
    }

    pub fn is_writable(&self) -> bool {
        self.capabilities().writable
    }

    /// Filesystem path when the file lives on local disk.
    pub fn local_path(&self) -> Option<PathBuf> {
        match self.protocol.as_ref() {
            DataProtocol::Local(_) => Some(LocalProtocol::path(&self.reference)),
            _ => None,
        }
    }

    /// Format of the content. Derived references name their format;
    /// everything else is detected from the extension chain.
    pub fn format(&self) -> Option<Arc<DataFormat>> {
        match self.protocol.as_ref() {
            DataProtocol::Derived(_) => DerivedProtocol::parse(&self.reference)
                .ok()
                .and_then(|(format, _)| self.registry.formats().get(format)),
            _ => self.registry.formats().detect(&self.reference).format,
        }
    }

    pub async fn exists(&self) -> Result<bool, DataError> {
        self.exists_boxed().await
    }

    fn exists_boxed(&self) -> BoxFuture<'_, Result<bool, DataError>> {
        async move {
            match self.protocol.as_ref() {
                DataProtocol::Derived(_) => {
                    let (_, inner) = DerivedProtocol::parse(&self.reference)?;
                    self.registry.resolve(inner)?.exists_boxed().await
                }
                protocol => match protocol.readable() {
                    Some(readable) => readable.exists(&self.reference).await,
                    None => Err(self.unsupported("exists")),
                },
            }
        }
        .boxed()
    }

    pub async fn open(&self) -> Result<ReadStream, DataError> {
        if matches!(self.protocol.as_ref(), DataProtocol::Derived(_)) {
            DerivedProtocol::derivation_chain(&self.reference)?;
        }
        self.open_boxed().await
    }

    fn open_boxed(&self) -> BoxFuture<'_, Result<ReadStream, DataError>> {
        async move {
            let derived = match self.protocol.as_ref() {
                DataProtocol::Derived(derived) => derived,
                protocol => {
                    return match protocol.readable() {
                        Some(readable) => readable.open(&self.reference).await,
                        None => Err(self.unsupported("open")),
                    }
                }
            };

            let (format_name, inner_reference) = DerivedProtocol::parse(&self.reference)?;
            let format = self.registry.formats().require(format_name)?;
            let backing = format.backing_format().ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "format '{}' is not backed by another format",
                    format_name
                ))
            })?;

            let inner = self.registry.resolve(inner_reference)?;
            let inner_format = inner.format();
            if inner_format.as_ref().map(|f| f.name()) != Some(backing) {
                return Err(ConfigError::FormatMismatch {
                    port: self.reference.clone(),
                    expected: backing.to_string(),
                    actual: inner_format
                        .map(|f| f.name().to_string())
                        .unwrap_or_else(|| "unknown".to_string()),
                }
                .into());
            }

            let translator = derived.translator(format_name).ok_or_else(|| {
                ConfigError::Invalid(format!("no translator for format '{}'", format_name))
            })?;

            tracing::debug!("Resolving {} through {}", self.reference, inner_reference);
            let stream = inner.open_boxed().await?;
            translator.translate(stream).await
        }
        .boxed()
    }

    /// Open for writing. Local and distributed storage overwrite; object
    /// storage refuses when the object exists.
    pub async fn create(&self) -> Result<WriteStream, DataError> {
        self.forget_metadata();
        match self.protocol.writable() {
            Some(writable) => writable.create(&self.reference).await,
            None => Err(self.unsupported("create")),
        }
    }

    pub async fn delete(&self) -> Result<(), DataError> {
        self.forget_metadata();
        match self.protocol.writable() {
            Some(writable) => writable.delete(&self.reference).await,
            None => Err(self.unsupported("delete")),
        }
    }

    /// Storage facts merged with extension-based format detection.
    pub async fn metadata(&self) -> Result<Metadata, DataError> {
        if let Some(cached) = self.cached_metadata() {
            return Ok(cached);
        }

        let raw = self.stat_boxed().await?;
        let detection = self.registry.formats().detect(&self.reference);
        let format = self.format();
        let metadata = Metadata {
            content_length: raw.content_length,
            content_type: format
                .as_ref()
                .map(|f| f.content_type().to_string())
                .unwrap_or(detection.content_type),
            content_encoding: detection.content_encoding,
            data_format: format.map(|f| f.name().to_string()),
            last_modified: raw.last_modified,
            content_hash: raw.content_hash,
        };

        if let Ok(mut slot) = self.metadata.lock() {
            *slot = Some(metadata.clone());
        }
        Ok(metadata)
    }

    fn stat_boxed(&self) -> BoxFuture<'_, Result<RawStat, DataError>> {
        async move {
            match self.protocol.as_ref() {
                DataProtocol::Derived(_) => {
                    let (_, inner) = DerivedProtocol::parse(&self.reference)?;
                    let raw = self.registry.resolve(inner)?.stat_boxed().await?;
                    // translated length is unknown until read
                    Ok(RawStat {
                        content_length: None,
                        ..raw
                    })
                }
                protocol => match protocol.readable() {
                    Some(readable) => readable.stat(&self.reference).await,
                    None => Err(self.unsupported("metadata")),
                },
            }
        }
        .boxed()
    }

    fn cached_metadata(&self) -> Option<Metadata> {
        self.metadata.lock().ok().and_then(|slot| slot.clone())
    }

    fn forget_metadata(&self) {
        if let Ok(mut slot) = self.metadata.lock() {
            *slot = None;
        }
    }

    fn unsupported(&self, operation: &'static str) -> DataError {
        DataError::Unsupported {
            protocol: self.protocol_name().to_string(),
            operation,
        }
    }
}

impl fmt::Debug for DataFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataFile")
            .field("reference", &self.reference)
            .field("protocol", &self.protocol_name())
            .finish()
    }
}

impl PartialEq for DataFile {
    fn eq(&self, other: &Self) -> bool {
        self.reference == other.reference
    }
}

impl Eq for DataFile {}

impl fmt::Display for DataFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reference)
    }
}

/// The data bound to one port: a format and the files carrying it.
#[derive(Debug, Clone)]
pub struct Data {
    name: String,
    format: Arc<DataFormat>,
    files: Vec<DataFile>,
}

impl Data {
    pub fn new(name: impl Into<String>, format: Arc<DataFormat>, files: Vec<DataFile>) -> Self {
        Self {
            name: name.into(),
            format,
            files,
        }
    }

    pub fn single(name: impl Into<String>, format: Arc<DataFormat>, file: DataFile) -> Self {
        Self::new(name, format, vec![file])
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn format(&self) -> &Arc<DataFormat> {
        &self.format
    }

    pub fn files(&self) -> &[DataFile] {
        &self.files
    }

    /// First file, the whole payload for single-file formats.
    pub fn file(&self) -> Option<&DataFile> {
        self.files.first()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn references(&self) -> Vec<String> {
        self.files.iter().map(|f| f.reference().to_string()).collect()
    }
}
