use super::ReadStream;
use crate::{ConfigError, DataError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tokio::io::AsyncReadExt;

pub(super) const SCHEME: &str = "derived";

/// Turns the bytes of a backing format into the bytes of a derived one.
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, input: ReadStream) -> Result<ReadStream, DataError>;
}

/// Translator over the whole buffered content.
pub struct FnTranslator<F> {
    func: F,
}

impl<F> FnTranslator<F>
where
    F: Fn(Vec<u8>) -> Result<Vec<u8>, String> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F> Translator for FnTranslator<F>
where
    F: Fn(Vec<u8>) -> Result<Vec<u8>, String> + Send + Sync,
{
    async fn translate(&self, mut input: ReadStream) -> Result<ReadStream, DataError> {
        let mut buffer = Vec::new();
        input
            .read_to_end(&mut buffer)
            .await
            .map_err(|e| DataError::io(SCHEME, e))?;
        let output = (self.func)(buffer).map_err(|e| DataError::transport(SCHEME, e))?;
        Ok(Box::new(std::io::Cursor::new(output)))
    }
}

/// Read-only protocol whose content is computed from another reference.
///
/// References look like `derived:<format>:<inner-reference>`. The actual
/// resolution needs the whole data registry and lives on `DataFile`; this
/// type only owns the translators, keyed by derived format name.
#[derive(Default)]
pub struct DerivedProtocol {
    translators: RwLock<HashMap<String, Arc<dyn Translator>>>,
}

impl DerivedProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split a derived reference into `(format, inner_reference)`.
    pub fn parse(reference: &str) -> Result<(&str, &str), DataError> {
        let rest = reference
            .strip_prefix(SCHEME)
            .and_then(|r| r.strip_prefix(':'))
            .ok_or_else(|| DataError::transport(reference, "not a derived reference"))?;
        match rest.split_once(':') {
            Some((format, inner)) if !format.is_empty() && !inner.is_empty() => Ok((format, inner)),
            _ => Err(DataError::transport(
                reference,
                "derived references look like derived:<format>:<inner>",
            )),
        }
    }

    /// Formats named along a nested derived reference, outermost first.
    /// A format appearing twice is a derivation cycle.
    pub fn derivation_chain(reference: &str) -> Result<Vec<&str>, DataError> {
        let mut chain: Vec<&str> = Vec::new();
        let mut current = reference;
        while current.starts_with("derived:") {
            let (format, inner) = Self::parse(current)?;
            if chain.contains(&format) {
                return Err(ConfigError::DerivationCycle(format.to_string()).into());
            }
            chain.push(format);
            current = inner;
        }
        Ok(chain)
    }

    pub fn register(&self, format: impl Into<String>, translator: Arc<dyn Translator>) {
        let format = format.into();
        tracing::debug!("Registering translator for derived format: {}", format);
        if let Ok(mut translators) = self.translators.write() {
            translators.insert(format, translator);
        }
    }

    pub fn translator(&self, format: &str) -> Option<Arc<dyn Translator>> {
        self.translators
            .read()
            .ok()
            .and_then(|translators| translators.get(format).cloned())
    }

    pub fn formats(&self) -> Vec<String> {
        let mut formats: Vec<String> = self
            .translators
            .read()
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default();
        formats.sort();
        formats
    }
}

impl fmt::Debug for DerivedProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedProtocol")
            .field("formats", &self.formats())
            .finish()
    }
}
