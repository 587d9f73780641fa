use crate::formats::FormatTable;
use async_trait::async_trait;
use pipecore::{ConfigError, FormatRegistry, Ports, Step, TaskContext, TaskError, TaskStatus};
use piperuntime::{StepFactory, StepMetadata};
use std::collections::HashMap;
use tokio::io::AsyncWriteExt;

const STEP_TYPE: &str = "io.copy";

/// Streams `input` to `output` through the protocol layer, so a copy can
/// cross storage backends (local to object store, distributed to local).
///
/// Parameters:
/// - `format`: format of both ports (default `text`)
pub struct CopyStep {
    formats: FormatTable,
    inputs: Ports,
    outputs: Ports,
}

impl CopyStep {
    pub fn new(formats: &FormatRegistry) -> Result<Self, ConfigError> {
        let mut step = Self {
            formats: FormatTable::from_registry(formats),
            inputs: Ports::new(),
            outputs: Ports::new(),
        };
        step.set_format("text")?;
        Ok(step)
    }

    fn set_format(&mut self, name: &str) -> Result<(), ConfigError> {
        let format = self.formats.require(name)?;
        let mut inputs = Ports::new();
        inputs.add_port("input", format.clone())?;
        let mut outputs = Ports::new();
        outputs.add_port("output", format)?;
        self.inputs = inputs;
        self.outputs = outputs;
        Ok(())
    }
}

#[async_trait]
impl Step for CopyStep {
    fn step_type(&self) -> &str {
        STEP_TYPE
    }

    fn description(&self) -> &str {
        "Copy data between storage protocols"
    }

    fn input_ports(&self) -> &Ports {
        &self.inputs
    }

    fn output_ports(&self) -> &Ports {
        &self.outputs
    }

    fn configure(&mut self, params: &HashMap<String, String>) -> Result<(), ConfigError> {
        for (name, value) in params {
            match name.as_str() {
                "format" => self.set_format(value)?,
                _ => return Err(ConfigError::UnknownParameter(name.clone())),
            }
        }
        Ok(())
    }

    async fn execute(&self, ctx: &TaskContext, status: &mut TaskStatus) -> Result<(), TaskError> {
        let input = ctx.require_input("input")?;
        let output = ctx.require_output("output")?;
        let pairs = input.files().iter().zip(output.files());
        let total = input.len().max(1);

        for (done, (source, target)) in pairs.enumerate() {
            status.set_description(format!("{} -> {}", source.reference(), target.reference()));

            let mut reader = source.open().await?;
            let mut writer = target.create().await?;
            let copied = tokio::select! {
                copied = tokio::io::copy(&mut reader, &mut writer) => copied?,
                _ = ctx.cancellation().cancelled() => return Err(TaskError::Cancelled),
            };
            writer.shutdown().await?;

            tracing::debug!("Copied {} bytes to {}", copied, target.reference());
            status.increment("bytes", copied);
            status.increment("files", 1);
            status.set_progress((done + 1) as f64 / total as f64);
        }
        Ok(())
    }
}

pub struct CopyStepFactory;

impl StepFactory for CopyStepFactory {
    fn step_type(&self) -> &str {
        STEP_TYPE
    }

    fn create(&self, formats: &FormatRegistry) -> Result<Box<dyn Step>, ConfigError> {
        Ok(Box::new(CopyStep::new(formats)?))
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Copy data between storage protocols".to_string(),
            category: "io".to_string(),
            parameters: vec!["format".to_string()],
        }
    }
}
