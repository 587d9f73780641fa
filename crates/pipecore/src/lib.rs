//! Core abstractions for the pipeline engine
//!
//! Ports and formats, the data and storage protocol layer, task context,
//! status and result, and the step and requirement contracts. The runtime
//! and the built-in steps depend on this crate only through these types.

pub mod data;
mod error;
pub mod events;
mod format;
pub mod hashing;
mod pipeline;
mod port;
mod requirement;
mod step;
pub mod storage;
pub mod task;

pub use data::{Data, DataFile, DataRegistry, Metadata, ProtocolSettings};
pub use error::{
    ConfigError, DataError, DependencyError, ErrorKind, ExternalJobError, PipeError, TaskError,
};
pub use events::*;
pub use format::{DataFormat, Detection, FormatRegistry, FormatValidator};
pub use pipeline::{Connection, ErrorHandling, Pipeline, PipelineSettings, StepSpec};
pub use port::{validate_connection, Cardinality, Port, Ports};
pub use requirement::{parse_flag, LogProgress, NoProgress, ProgressSink, Requirement};
pub use step::Step;
pub use storage::{ArtifactStore, StorageKey};
pub use task::{Resources, TaskContext, TaskContextBuilder, TaskDescriptor, TaskId, TaskResult, TaskStatus};

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, PipeError>;
