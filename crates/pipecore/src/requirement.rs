use crate::{ConfigError, DependencyError};
use async_trait::async_trait;
use std::collections::HashMap;

/// Receives installation progress as fractions in `[0, 1]`.
pub trait ProgressSink: Send + Sync {
    fn report(&self, requirement: &str, fraction: f64, message: &str);
}

/// Discards progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _requirement: &str, _fraction: f64, _message: &str) {}
}

/// Logs progress through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn report(&self, requirement: &str, fraction: f64, message: &str) {
        tracing::info!("{}: {:>3.0}% {}", requirement, fraction * 100.0, message);
    }
}

/// Something a step needs from its environment.
#[async_trait]
pub trait Requirement: Send + Sync {
    fn name(&self) -> &str;

    /// Missing optional requirements are skipped with a warning.
    fn optional(&self) -> bool;

    fn installable(&self) -> bool;

    /// Apply parameters; unknown keys fail with `UnknownParameter`.
    fn configure(&mut self, params: &HashMap<String, String>) -> Result<(), ConfigError>;

    /// Never fails: any error while checking means "not available".
    async fn is_available(&self) -> bool;

    async fn install(&self, progress: &dyn ProgressSink) -> Result<(), DependencyError>;
}

/// Parse a boolean parameter.
pub fn parse_flag(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Ok(true),
        "false" | "no" | "0" | "off" => Ok(false),
        _ => Err(ConfigError::invalid_parameter(
            name,
            format!("'{}' is not a boolean", value),
        )),
    }
}
