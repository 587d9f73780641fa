use pipecore::{ConfigError, DataFormat, FormatRegistry};
use std::collections::HashMap;
use std::sync::Arc;

/// Snapshot of a format registry, so steps can rebuild their ports when
/// parameters change the formats they use.
#[derive(Debug, Clone, Default)]
pub(crate) struct FormatTable {
    formats: HashMap<String, Arc<DataFormat>>,
}

impl FormatTable {
    pub(crate) fn from_registry(registry: &FormatRegistry) -> Self {
        let formats = registry
            .names()
            .into_iter()
            .filter_map(|name| registry.get(&name).map(|format| (name, format)))
            .collect();
        Self { formats }
    }

    pub(crate) fn require(&self, name: &str) -> Result<Arc<DataFormat>, ConfigError> {
        self.formats
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownFormat(name.to_string()))
    }
}
