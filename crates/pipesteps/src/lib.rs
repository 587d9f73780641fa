//! Standard step library
//!
//! Built-in steps and the requirements they can declare.

mod copy;
mod formats;
pub mod requirements;
mod shell;

pub use copy::{CopyStep, CopyStepFactory};
pub use requirements::{ContainerImageRequirement, ExecutableRequirement, PullProgress};
pub use shell::{ShellStep, ShellStepFactory};
use piperuntime::StepRegistry;

use std::sync::Arc;

/// Register all standard steps with a registry
pub fn register_all(registry: &mut StepRegistry) {
    registry.register(Arc::new(CopyStepFactory));
    registry.register(Arc::new(ShellStepFactory));
}
