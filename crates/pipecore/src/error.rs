use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification shared by every error in the engine.
///
/// Task results carry the kind so that callers can react to a failure
/// without matching on the concrete error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    NotFound,
    Io,
    Dependency,
    ExternalJob,
    Execution,
    Cancelled,
}

#[derive(Error, Debug)]
pub enum PipeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Dependency error: {0}")]
    Dependency(#[from] DependencyError),

    #[error("External job error: {0}")]
    ExternalJob(#[from] ExternalJobError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipeError::Config(e) => e.kind(),
            PipeError::Data(e) => e.kind(),
            PipeError::Dependency(_) => ErrorKind::Dependency,
            PipeError::ExternalJob(_) => ErrorKind::ExternalJob,
            PipeError::Task(e) => e.kind(),
            PipeError::Execution(_) => ErrorKind::Execution,
            PipeError::Io(_) => ErrorKind::Io,
            PipeError::Serialization(_) => ErrorKind::Configuration,
        }
    }
}

/// Errors raised while configuring steps, ports, formats and protocols.
/// They are never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Duplicate port: {0}")]
    DuplicatePort(String),

    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Duplicate format: {0}")]
    DuplicateFormat(String),

    #[error("Unknown format: {0}")]
    UnknownFormat(String),

    #[error("Duplicate protocol scheme: {0}")]
    DuplicateScheme(String),

    #[error("No protocol registered for scheme '{0}'")]
    UnknownScheme(String),

    #[error("Format mismatch on '{port}': expected {expected}, got {actual}")]
    FormatMismatch {
        port: String,
        expected: String,
        actual: String,
    },

    #[error("Derivation cycle through format '{0}'")]
    DerivationCycle(String),

    #[error("Port '{0}' has no bound data")]
    MissingBinding(String),

    #[error("Output '{port}' cannot be created through protocol '{protocol}'")]
    NotWritable { port: String, protocol: String },

    #[error("Port '{port}' accepts {expected} file(s), got {actual}")]
    Cardinality {
        port: String,
        expected: String,
        actual: usize,
    },

    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    #[error("Invalid value for parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("Invalid connection: {0}")]
    InvalidConnection(String),

    #[error("Unknown step type: {0}")]
    UnknownStepType(String),

    #[error("Step not found: {0}")]
    StepNotFound(String),

    #[error("Cyclic dependency detected")]
    CyclicDependency,

    #[error("Thread count must be greater than zero")]
    InvalidThreadCount,

    #[error("Step '{0}' has no command line and cannot run on a cluster")]
    NotClusterCapable(String),

    #[error("{0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConfigError::PortNotFound(_) | ConfigError::StepNotFound(_) => ErrorKind::NotFound,
            _ => ErrorKind::Configuration,
        }
    }

    pub fn invalid_parameter(name: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised while reading or writing a `DataFile`.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Data not found: {0}")]
    NotFound(String),

    #[error("IO error on '{reference}': {source}")]
    Io {
        reference: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Transport error on '{reference}': {message}")]
    Transport { reference: String, message: String },

    #[error("Protocol '{protocol}' does not support {operation}")]
    Unsupported {
        protocol: String,
        operation: &'static str,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl DataError {
    /// Wrap an I/O error, keeping "not found" distinguishable.
    pub fn io(reference: impl Into<String>, source: std::io::Error) -> Self {
        let reference = reference.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            DataError::NotFound(reference)
        } else {
            DataError::Io { reference, source }
        }
    }

    pub fn transport(reference: impl Into<String>, message: impl Into<String>) -> Self {
        DataError::Transport {
            reference: reference.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DataError::NotFound(_) => ErrorKind::NotFound,
            DataError::Io { .. } | DataError::Transport { .. } | DataError::Unsupported { .. } => {
                ErrorKind::Io
            }
            DataError::Config(e) => e.kind(),
        }
    }
}

/// A requirement could not be satisfied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DependencyError {
    #[error("Requirement '{0}' is not available")]
    Unavailable(String),

    #[error("Requirement '{0}' is not available and cannot be installed")]
    NotInstallable(String),

    #[error("Installing '{name}' failed: {reason}")]
    InstallFailed { name: String, reason: String },
}

/// Failures talking to an external batch system.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExternalJobError {
    #[error("Failed to spawn '{command}': {reason}")]
    Spawn { command: String, reason: String },

    #[error("'{command}' timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    #[error("'{command}' exited with {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Submission did not print a job identifier")]
    EmptyJobId,

    #[error("Status of job {0} was empty")]
    EmptyStatus(String),

    #[error("Job {job_id} ended in state {state}")]
    JobFailed { job_id: String, state: String },
}

/// Anything that can make a task fail. Schedulers turn these into a failed
/// `TaskResult`; they never cross the scheduler boundary.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error(transparent)]
    External(#[from] ExternalJobError),

    #[error("Execution failed: {0}")]
    Failed(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("Task abandoned at shutdown")]
    Abandoned,
}

impl TaskError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::Config(e) => e.kind(),
            TaskError::Data(e) => e.kind(),
            TaskError::Dependency(_) => ErrorKind::Dependency,
            TaskError::External(_) => ErrorKind::ExternalJob,
            TaskError::Failed(_) | TaskError::Panicked(_) => ErrorKind::Execution,
            TaskError::Cancelled | TaskError::Abandoned => ErrorKind::Cancelled,
        }
    }
}

impl From<std::io::Error> for TaskError {
    fn from(e: std::io::Error) -> Self {
        TaskError::Failed(e.to_string())
    }
}
