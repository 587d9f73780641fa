use crate::{ConfigError, DataFormat};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// How many files a port binds for one execution partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    One,
    Optional,
    Many,
}

/// A named, typed slot through which data flows into or out of a step.
#[derive(Debug, Clone)]
pub struct Port {
    name: String,
    format: Arc<DataFormat>,
    cardinality: Cardinality,
    description: String,
}

impl Port {
    pub fn new(name: impl Into<String>, format: Arc<DataFormat>) -> Self {
        Self {
            name: name.into(),
            format,
            cardinality: Cardinality::One,
            description: String::new(),
        }
    }

    pub fn with_cardinality(mut self, cardinality: Cardinality) -> Self {
        self.cardinality = cardinality;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn format(&self) -> &Arc<DataFormat> {
        &self.format
    }

    pub fn cardinality(&self) -> Cardinality {
        self.cardinality
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_required(&self) -> bool {
        self.cardinality != Cardinality::Optional
    }

    /// Range of file counts a binding on this port may carry.
    pub fn accepted_files(&self) -> (usize, usize) {
        let max = match (self.cardinality, self.format.is_multi_file()) {
            (_, true) => self.format.max_files(),
            (Cardinality::Many, false) => usize::MAX,
            (_, false) => 1,
        };
        (1, max)
    }
}

/// The port set of one step, keyed by name, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct Ports {
    ports: Vec<Port>,
}

impl Ports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_port(
        &mut self,
        name: impl Into<String>,
        format: Arc<DataFormat>,
    ) -> Result<&Port, ConfigError> {
        self.add(Port::new(name, format))
    }

    pub fn add(&mut self, port: Port) -> Result<&Port, ConfigError> {
        if self.contains(port.name()) {
            return Err(ConfigError::DuplicatePort(port.name().to_string()));
        }
        self.ports.push(port);
        Ok(&self.ports[self.ports.len() - 1])
    }

    pub fn get_port(&self, name: &str) -> Result<&Port, ConfigError> {
        self.ports
            .iter()
            .find(|p| p.name() == name)
            .ok_or_else(|| ConfigError::PortNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ports.iter().any(|p| p.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Port> {
        self.ports.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.ports.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

/// An edge is valid iff the producing format equals the consuming format.
/// There is no implicit coercion.
pub fn validate_connection(output: &Port, input: &Port) -> Result<(), ConfigError> {
    if output.format().name() != input.format().name() {
        return Err(ConfigError::FormatMismatch {
            port: input.name().to_string(),
            expected: input.format().name().to_string(),
            actual: output.format().name().to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FormatRegistry;

    #[test]
    fn test_duplicate_port_rejected() {
        let formats = FormatRegistry::standard();
        let mut ports = Ports::new();
        ports.add_port("reads", formats.get("fastq").unwrap()).unwrap();

        let err = ports
            .add_port("reads", formats.get("bam").unwrap())
            .unwrap_err();
        assert_eq!(err, ConfigError::DuplicatePort("reads".to_string()));
        assert_eq!(ports.len(), 1);
    }

    #[test]
    fn test_missing_port_is_not_found() {
        let ports = Ports::new();
        let err = ports.get_port("nope").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
    }

    #[test]
    fn test_connection_requires_equal_formats() {
        let formats = FormatRegistry::standard();
        let names = formats.names();

        for produced in &names {
            for consumed in &names {
                let output = Port::new("out", formats.get(produced).unwrap());
                let input = Port::new("in", formats.get(consumed).unwrap());
                let result = validate_connection(&output, &input);
                if produced == consumed {
                    assert!(result.is_ok(), "{} -> {}", produced, consumed);
                } else {
                    assert!(
                        matches!(result, Err(ConfigError::FormatMismatch { .. })),
                        "{} -> {}",
                        produced,
                        consumed
                    );
                }
            }
        }
    }

    #[test]
    fn test_accepted_files() {
        let formats = FormatRegistry::standard();
        let single = Port::new("a", formats.get("bam").unwrap());
        assert_eq!(single.accepted_files(), (1, 1));

        let many = Port::new("b", formats.get("bam").unwrap()).with_cardinality(Cardinality::Many);
        assert_eq!(many.accepted_files(), (1, usize::MAX));

        let index = Port::new("c", formats.get("bowtie-index").unwrap());
        assert_eq!(index.accepted_files(), (1, 6));
    }
}
