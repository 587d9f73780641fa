use crate::{ConfigError, Ports, Requirement, TaskContext, TaskError, TaskStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// A unit of processing with typed input and output ports.
///
/// Steps are configured once from string parameters and then executed many
/// times, once per task, each with its own context.
#[async_trait]
pub trait Step: Send + Sync {
    /// Unique type identifier (e.g. "io.copy", "shell.run")
    fn step_type(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn input_ports(&self) -> &Ports;

    fn output_ports(&self) -> &Ports;

    /// Apply parameters. The default accepts none.
    fn configure(&mut self, params: &HashMap<String, String>) -> Result<(), ConfigError> {
        match params.keys().next() {
            Some(name) => Err(ConfigError::UnknownParameter(name.clone())),
            None => Ok(()),
        }
    }

    /// Software that must be present before any task of this step runs.
    fn requirements(&self) -> Vec<Arc<dyn Requirement>> {
        Vec::new()
    }

    /// Command line for running one task outside this process. Steps
    /// without one can only run on the local scheduler.
    fn command_line(&self, _ctx: &TaskContext) -> Option<Vec<String>> {
        None
    }

    async fn execute(&self, ctx: &TaskContext, status: &mut TaskStatus) -> Result<(), TaskError>;
}
