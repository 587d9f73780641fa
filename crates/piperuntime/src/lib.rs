//! Pipeline execution runtime
//!
//! Schedulers (local worker pool and cluster batch systems), the emergency
//! stop registry, the artifact cache, requirement checks, pipeline
//! validation and the runner that drives a pipeline through a scheduler.

pub mod emergency;
mod registry;
mod requirements;
mod runner;
mod runtime;
pub mod scheduler;
pub mod storage;
mod validate;

pub use emergency::{EmergencyStopRegistry, StopKey, StopReport, StopTask};
pub use registry::{StepFactory, StepMetadata, StepRegistry};
pub use requirements::{check_requirements, ensure_requirements, RequirementReport};
pub use runner::{PipelineRunner, RunSummary};
pub use runtime::{PipeRuntime, RuntimeConfig, SchedulerKind};
pub use scheduler::{
    BatchSystem, ClusterConfig, ClusterScheduler, JobState, LocalScheduler, SchedulerError, Task, TaskHandle,
    TaskScheduler, TaskState,
};
pub use storage::{get_or_compute, ArtifactStore, DirectoryStore, MemoryStore, StorageKey};
pub use validate::{validate_pipeline, ValidatedPipeline};
