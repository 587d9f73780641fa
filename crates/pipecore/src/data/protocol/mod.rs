//! Storage protocols.
//!
//! The set of shipped backends is closed, so a protocol is a tagged union
//! over the concrete variants. Each variant implements the capability
//! traits it supports (`Readable`, `Writable`); symbolic protocols perform
//! no real I/O.

mod derived;
mod distributed;
mod local;
mod null;
mod object;

pub use derived::{DerivedProtocol, FnTranslator, Translator};
pub use distributed::DistributedProtocol;
pub use local::LocalProtocol;
pub use null::NullProtocol;
pub use object::ObjectStore;

use crate::{ConfigError, DataError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// A readable byte stream produced by `open`.
pub type ReadStream = Box<dyn AsyncRead + Send + Unpin>;

/// A writable byte stream produced by `create`. Data is only guaranteed to
/// be durable once `shutdown()` has completed.
pub type WriteStream = Box<dyn AsyncWrite + Send + Unpin>;

/// What a protocol can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub readable: bool,
    pub writable: bool,
    /// No bytes are stored; content is annotation-derived or absent.
    pub symbolic: bool,
    pub local_only: bool,
    pub distributed: bool,
}

/// Storage-level facts about a reference, before format detection.
#[derive(Debug, Clone, Default)]
pub struct RawStat {
    pub content_length: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
    pub content_hash: Option<String>,
}

#[async_trait]
pub trait Readable: Send + Sync {
    async fn exists(&self, reference: &str) -> Result<bool, DataError>;

    async fn open(&self, reference: &str) -> Result<ReadStream, DataError>;

    async fn stat(&self, reference: &str) -> Result<RawStat, DataError>;
}

#[async_trait]
pub trait Writable: Send + Sync {
    async fn create(&self, reference: &str) -> Result<WriteStream, DataError>;

    async fn delete(&self, reference: &str) -> Result<(), DataError>;
}

/// Marker for protocols whose references carry no bytes of their own.
pub trait SymbolicOnly {}

/// Every storage backend the engine ships.
#[derive(Debug)]
pub enum DataProtocol {
    Local(LocalProtocol),
    Distributed(DistributedProtocol),
    Object(ObjectStore),
    Derived(DerivedProtocol),
    Null(NullProtocol),
}

impl DataProtocol {
    pub fn scheme(&self) -> &str {
        match self {
            DataProtocol::Local(_) => local::SCHEME,
            DataProtocol::Distributed(_) => distributed::SCHEME,
            DataProtocol::Object(store) => store.scheme(),
            DataProtocol::Derived(_) => derived::SCHEME,
            DataProtocol::Null(_) => null::SCHEME,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        match self {
            DataProtocol::Local(_) => Capabilities {
                readable: true,
                writable: true,
                local_only: true,
                ..Default::default()
            },
            DataProtocol::Distributed(_) => Capabilities {
                readable: true,
                writable: true,
                distributed: true,
                ..Default::default()
            },
            DataProtocol::Object(_) => Capabilities {
                readable: true,
                writable: true,
                distributed: true,
                ..Default::default()
            },
            DataProtocol::Derived(_) => Capabilities {
                readable: true,
                symbolic: true,
                distributed: true,
                ..Default::default()
            },
            DataProtocol::Null(_) => Capabilities {
                readable: true,
                writable: true,
                symbolic: true,
                distributed: true,
                ..Default::default()
            },
        }
    }

    /// Direct read access. The derived protocol needs the registry to
    /// resolve its backing reference and is handled by `DataFile`.
    pub(crate) fn readable(&self) -> Option<&dyn Readable> {
        match self {
            DataProtocol::Local(p) => Some(p),
            DataProtocol::Distributed(p) => Some(p),
            DataProtocol::Object(p) => Some(p),
            DataProtocol::Null(p) => Some(p),
            DataProtocol::Derived(_) => None,
        }
    }

    pub(crate) fn writable(&self) -> Option<&dyn Writable> {
        match self {
            DataProtocol::Local(p) => Some(p),
            DataProtocol::Distributed(p) => Some(p),
            DataProtocol::Object(p) => Some(p),
            DataProtocol::Null(p) => Some(p),
            DataProtocol::Derived(_) => None,
        }
    }
}

/// Split `scheme:` off a reference. Bare paths have no scheme.
pub fn split_scheme(reference: &str) -> (Option<&str>, &str) {
    if let Some((scheme, rest)) = reference.split_once("://") {
        if is_scheme(scheme) {
            return (Some(scheme), rest);
        }
    }
    if let Some((scheme, rest)) = reference.split_once(':') {
        // single letters are drive prefixes, not schemes
        if scheme.len() > 1 && is_scheme(scheme) {
            return (Some(scheme), rest);
        }
    }
    (None, reference)
}

fn is_scheme(candidate: &str) -> bool {
    let mut chars = candidate.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

/// One protocol instance per scheme.
#[derive(Debug, Default)]
pub struct ProtocolRegistry {
    protocols: HashMap<String, Arc<DataProtocol>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, protocol: DataProtocol) -> Result<(), ConfigError> {
        let scheme = protocol.scheme().to_string();
        if self.protocols.contains_key(&scheme) {
            return Err(ConfigError::DuplicateScheme(scheme));
        }
        tracing::debug!("Registering data protocol: {}", scheme);
        self.protocols.insert(scheme, Arc::new(protocol));
        Ok(())
    }

    pub fn get(&self, scheme: &str) -> Option<&Arc<DataProtocol>> {
        self.protocols.get(scheme)
    }

    /// Protocol serving `reference`; bare paths go to the local protocol.
    pub fn protocol_for(&self, reference: &str) -> Result<&Arc<DataProtocol>, ConfigError> {
        let scheme = split_scheme(reference).0.unwrap_or(local::SCHEME);
        self.protocols
            .get(scheme)
            .ok_or_else(|| ConfigError::UnknownScheme(scheme.to_string()))
    }

    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.protocols.keys().cloned().collect();
        schemes.sort();
        schemes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_scheme() {
        assert_eq!(split_scheme("file:///tmp/a.txt"), (Some("file"), "/tmp/a.txt"));
        assert_eq!(split_scheme("s3://bucket/key"), (Some("s3"), "bucket/key"));
        assert_eq!(
            split_scheme("derived:upper:file:///tmp/a.txt"),
            (Some("derived"), "upper:file:///tmp/a.txt")
        );
        assert_eq!(split_scheme("/tmp/a.txt"), (None, "/tmp/a.txt"));
        assert_eq!(split_scheme("relative/a.txt"), (None, "relative/a.txt"));
        assert_eq!(split_scheme("C:\\data\\a.txt"), (None, "C:\\data\\a.txt"));
    }

    #[test]
    fn test_one_protocol_per_scheme() {
        let mut registry = ProtocolRegistry::new();
        registry
            .register(DataProtocol::Local(LocalProtocol::new()))
            .unwrap();
        let err = registry
            .register(DataProtocol::Local(LocalProtocol::new()))
            .unwrap_err();
        assert_eq!(err, ConfigError::DuplicateScheme("file".to_string()));
    }

    #[test]
    fn test_unknown_scheme() {
        let registry = ProtocolRegistry::new();
        let err = registry.protocol_for("ftp://host/file").unwrap_err();
        assert_eq!(err, ConfigError::UnknownScheme("ftp".to_string()));
    }
}
