use super::protocol::{
    DataProtocol, DerivedProtocol, DistributedProtocol, LocalProtocol, NullProtocol, ObjectStore,
    ProtocolRegistry, Translator,
};
use super::DataFile;
use crate::{ConfigError, FormatRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Settings for the protocols that talk to external systems.
#[derive(Debug, Clone)]
pub struct ProtocolSettings {
    pub distributed_command: PathBuf,
    pub object_endpoint: String,
    pub command_timeout: Duration,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            distributed_command: PathBuf::from("hdfs"),
            object_endpoint: "http://127.0.0.1:9000".to_string(),
            command_timeout: Duration::from_secs(30),
        }
    }
}

/// Formats plus protocols: everything needed to turn a reference string
/// into a `DataFile`.
#[derive(Debug, Default)]
pub struct DataRegistry {
    formats: FormatRegistry,
    protocols: ProtocolRegistry,
}

impl DataRegistry {
    pub fn new(formats: FormatRegistry, protocols: ProtocolRegistry) -> Self {
        Self { formats, protocols }
    }

    /// The standard formats and every shipped protocol.
    pub fn standard(settings: &ProtocolSettings) -> Self {
        let mut protocols = ProtocolRegistry::new();
        let shipped = [
            DataProtocol::Local(LocalProtocol::new()),
            DataProtocol::Distributed(DistributedProtocol::new(
                &settings.distributed_command,
                settings.command_timeout,
            )),
            DataProtocol::Object(ObjectStore::s3(&settings.object_endpoint)),
            DataProtocol::Object(ObjectStore::gs(&settings.object_endpoint)),
            DataProtocol::Derived(DerivedProtocol::new()),
            DataProtocol::Null(NullProtocol::new()),
        ];
        for protocol in shipped {
            // shipped schemes are distinct
            let _ = protocols.register(protocol);
        }
        Self::new(FormatRegistry::standard(), protocols)
    }

    pub fn formats(&self) -> &FormatRegistry {
        &self.formats
    }

    pub fn formats_mut(&mut self) -> &mut FormatRegistry {
        &mut self.formats
    }

    pub fn protocols(&self) -> &ProtocolRegistry {
        &self.protocols
    }

    pub fn protocols_mut(&mut self) -> &mut ProtocolRegistry {
        &mut self.protocols
    }

    /// Attach the translator producing `format`. The format must be
    /// registered and declare the format it is backed by.
    pub fn register_translator(
        &self,
        format: &str,
        translator: Arc<dyn Translator>,
    ) -> Result<(), ConfigError> {
        let derived_format = self.formats.require(format)?;
        if derived_format.backing_format().is_none() {
            return Err(ConfigError::Invalid(format!(
                "format '{}' is not backed by another format",
                format
            )));
        }
        match self.protocols.get("derived").map(|p| p.as_ref()) {
            Some(DataProtocol::Derived(derived)) => {
                derived.register(format, translator);
                Ok(())
            }
            _ => Err(ConfigError::UnknownScheme("derived".to_string())),
        }
    }

    /// Resolve a reference to a `DataFile`. Pure lookup; nothing is touched
    /// on the storage side.
    pub fn resolve(self: &Arc<Self>, reference: &str) -> Result<DataFile, ConfigError> {
        let protocol = self.protocols.protocol_for(reference)?.clone();
        Ok(DataFile::new(reference, protocol, self.clone()))
    }
}
