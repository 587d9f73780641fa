use pipecore::{ConfigError, FormatRegistry, Step};
use std::collections::HashMap;
use std::sync::Arc;

/// Factory trait for creating step instances
pub trait StepFactory: Send + Sync {
    /// Step type identifier
    fn step_type(&self) -> &str;

    /// Create an unconfigured step. Ports are built against `formats`.
    fn create(&self, formats: &FormatRegistry) -> Result<Box<dyn Step>, ConfigError>;

    fn metadata(&self) -> StepMetadata {
        StepMetadata::default()
    }
}

/// Metadata about a step type
#[derive(Debug, Clone)]
pub struct StepMetadata {
    pub description: String,
    pub category: String,
    pub parameters: Vec<String>,
}

impl Default for StepMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
            parameters: Vec::new(),
        }
    }
}

/// Registry of available step types
pub struct StepRegistry {
    factories: HashMap<String, Arc<dyn StepFactory>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a step factory
    pub fn register(&mut self, factory: Arc<dyn StepFactory>) {
        let step_type = factory.step_type().to_string();
        tracing::info!("Registering step type: {}", step_type);
        self.factories.insert(step_type, factory);
    }

    /// Create and configure a step
    pub fn create_step(
        &self,
        step_type: &str,
        params: &HashMap<String, String>,
        formats: &FormatRegistry,
    ) -> Result<Arc<dyn Step>, ConfigError> {
        let factory = self
            .factories
            .get(step_type)
            .ok_or_else(|| ConfigError::UnknownStepType(step_type.to_string()))?;

        let mut step = factory.create(formats)?;
        step.configure(params)?;
        Ok(Arc::from(step))
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.factories.contains_key(step_type)
    }

    /// All registered step types, sorted
    pub fn list_step_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn get_metadata(&self, step_type: &str) -> Option<StepMetadata> {
        self.factories.get(step_type).map(|f| f.metadata())
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::new()
    }
}
