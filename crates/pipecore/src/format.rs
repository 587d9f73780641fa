//! Data formats and extension-based format detection.

use crate::ConfigError;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Checks the leading bytes of a stream claimed to be in some format.
pub trait FormatValidator: Send + Sync {
    fn validate(&self, head: &[u8]) -> Result<(), String>;
}

/// A named data shape. Immutable once registered.
#[derive(Clone)]
pub struct DataFormat {
    name: String,
    default_extension: String,
    extensions: Vec<String>,
    content_type: String,
    multi_file: bool,
    max_files: usize,
    validator: Option<Arc<dyn FormatValidator>>,
    backed_by: Option<String>,
}

impl DataFormat {
    pub fn new(name: impl Into<String>, default_extension: impl Into<String>) -> Self {
        let default_extension = default_extension.into().to_ascii_lowercase();
        Self {
            name: name.into(),
            extensions: vec![default_extension.clone()],
            default_extension,
            content_type: "application/octet-stream".to_string(),
            multi_file: false,
            max_files: 1,
            validator: None,
            backed_by: None,
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        let extension = extension.into().to_ascii_lowercase();
        if !self.extensions.contains(&extension) {
            self.extensions.push(extension);
        }
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Mark the format as spanning several files per logical unit.
    pub fn multi_file(mut self, max_files: usize) -> Self {
        self.multi_file = true;
        self.max_files = max_files.max(1);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn FormatValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Declare that bytes of this format are produced by translating `format`.
    pub fn backed_by(mut self, format: impl Into<String>) -> Self {
        self.backed_by = Some(format.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_extension(&self) -> &str {
        &self.default_extension
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn is_multi_file(&self) -> bool {
        self.multi_file
    }

    pub fn max_files(&self) -> usize {
        self.max_files
    }

    pub fn backing_format(&self) -> Option<&str> {
        self.backed_by.as_deref()
    }

    pub fn validate(&self, head: &[u8]) -> Result<(), String> {
        match &self.validator {
            Some(validator) => validator.validate(head),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataFormat")
            .field("name", &self.name)
            .field("extensions", &self.extensions)
            .field("content_type", &self.content_type)
            .field("multi_file", &self.multi_file)
            .field("backed_by", &self.backed_by)
            .finish()
    }
}

impl PartialEq for DataFormat {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for DataFormat {}

/// Result of inspecting a reference's extension chain.
#[derive(Debug, Clone)]
pub struct Detection {
    pub format: Option<Arc<DataFormat>>,
    pub content_type: String,
    pub content_encoding: String,
}

const COMPRESSION_SUFFIXES: &[(&str, &str)] = &[("gz", "gzip"), ("bz2", "bzip2")];

const KNOWN_CONTENT_TYPES: &[(&str, &str)] = &[
    ("txt", "text/plain"),
    ("log", "text/plain"),
    ("csv", "text/csv"),
    ("tsv", "text/tab-separated-values"),
    ("json", "application/json"),
    ("xml", "application/xml"),
    ("html", "text/html"),
    ("pdf", "application/pdf"),
    ("xlsx", "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"),
];

/// Every format known to an engine, by name and by extension.
#[derive(Debug, Default)]
pub struct FormatRegistry {
    formats: HashMap<String, Arc<DataFormat>>,
    by_extension: HashMap<String, Arc<DataFormat>>,
}

impl FormatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the common formats shipped with the engine.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        let formats = [
            DataFormat::new("text", "txt").with_content_type("text/plain"),
            DataFormat::new("csv", "csv").with_content_type("text/csv"),
            DataFormat::new("tsv", "tsv")
                .with_extension("tab")
                .with_content_type("text/tab-separated-values"),
            DataFormat::new("json", "json").with_content_type("application/json"),
            DataFormat::new("fasta", "fasta")
                .with_extension("fa")
                .with_extension("fna")
                .with_content_type("text/x-fasta"),
            DataFormat::new("fasta-index", "fa.fai")
                .with_extension("fasta.fai")
                .with_content_type("text/tab-separated-values"),
            DataFormat::new("fastq", "fastq")
                .with_extension("fq")
                .with_content_type("text/x-fastq"),
            DataFormat::new("sam", "sam").with_content_type("text/x-sam"),
            DataFormat::new("bam", "bam").with_content_type("application/x-bam"),
            DataFormat::new("vcf", "vcf").with_content_type("text/x-vcf"),
            DataFormat::new("bed", "bed").with_content_type("text/x-bed"),
            DataFormat::new("gtf", "gtf").with_content_type("text/x-gtf"),
            DataFormat::new("bowtie-index", "bt2")
                .multi_file(6)
                .with_content_type("application/octet-stream"),
        ];
        for format in formats {
            // the standard set has unique names and no backing chains
            let _ = registry.register(format);
        }
        registry
    }

    /// Register a format. Fails on duplicate names and on `backed_by`
    /// chains that lead back to the format itself.
    pub fn register(&mut self, format: DataFormat) -> Result<Arc<DataFormat>, ConfigError> {
        if self.formats.contains_key(format.name()) {
            return Err(ConfigError::DuplicateFormat(format.name().to_string()));
        }
        self.check_backing_chain(&format)?;

        let format = Arc::new(format);
        for extension in format.extensions() {
            if let Some(existing) = self.by_extension.get(extension) {
                tracing::warn!(
                    "Extension '{}' already claimed by format '{}', ignoring it for '{}'",
                    extension,
                    existing.name(),
                    format.name()
                );
                continue;
            }
            self.by_extension.insert(extension.clone(), format.clone());
        }
        self.formats.insert(format.name().to_string(), format.clone());
        Ok(format)
    }

    fn check_backing_chain(&self, format: &DataFormat) -> Result<(), ConfigError> {
        let mut seen = vec![format.name().to_string()];
        let mut next = format.backing_format();
        while let Some(name) = next {
            if seen.iter().any(|s| s == name) {
                return Err(ConfigError::DerivationCycle(name.to_string()));
            }
            seen.push(name.to_string());
            next = self.formats.get(name).and_then(|f| f.backing_format());
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<DataFormat>> {
        self.formats.get(name).cloned()
    }

    pub fn require(&self, name: &str) -> Result<Arc<DataFormat>, ConfigError> {
        self.get(name)
            .ok_or_else(|| ConfigError::UnknownFormat(name.to_string()))
    }

    pub fn by_extension(&self, extension: &str) -> Option<Arc<DataFormat>> {
        self.by_extension
            .get(&extension.to_ascii_lowercase())
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.formats.keys().cloned().collect();
        names.sort();
        names
    }

    /// Inspect the extension chain of `reference` right-to-left.
    ///
    /// Compression suffixes are stripped first and reported as the content
    /// encoding; the longest remaining extension chain that names a
    /// registered format wins.
    pub fn detect(&self, reference: &str) -> Detection {
        let name = file_name(reference);
        let mut parts: Vec<&str> = name.split('.').collect();

        let mut encodings = Vec::new();
        while parts.len() > 1 {
            let last = parts[parts.len() - 1].to_ascii_lowercase();
            match COMPRESSION_SUFFIXES.iter().find(|(suffix, _)| *suffix == last) {
                Some((_, encoding)) => {
                    encodings.push(*encoding);
                    parts.pop();
                }
                None => break,
            }
        }
        // encodings were peeled outermost first; report them in applied order
        encodings.reverse();

        let mut format = None;
        for start in 1..parts.len() {
            let chain = parts[start..].join(".").to_ascii_lowercase();
            if let Some(found) = self.by_extension.get(&chain) {
                format = Some(found.clone());
                break;
            }
        }

        let content_type = match &format {
            Some(format) => format.content_type().to_string(),
            None => parts
                .last()
                .filter(|_| parts.len() > 1)
                .and_then(|ext| {
                    let ext = ext.to_ascii_lowercase();
                    KNOWN_CONTENT_TYPES
                        .iter()
                        .find(|(known, _)| *known == ext)
                        .map(|(_, content_type)| content_type.to_string())
                })
                .unwrap_or_else(|| "application/octet-stream".to_string()),
        };

        Detection {
            format,
            content_type,
            content_encoding: encodings.join(", "),
        }
    }
}

/// Last path segment of a reference, without query string or fragment.
fn file_name(reference: &str) -> &str {
    let end = reference.find(['?', '#']).unwrap_or(reference.len());
    let path = reference[..end].trim_end_matches('/');
    path.rsplit('/').next().unwrap_or(path)
}
