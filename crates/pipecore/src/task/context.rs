use crate::storage::ArtifactStore;
use crate::{ConfigError, Data, Port, Ports};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type TaskId = Uuid;

/// What a task asks of the machine it runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    pub cpus: u32,
    pub memory_mb: u64,
    pub walltime_secs: Option<u64>,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cpus: 1,
            memory_mb: 1024,
            walltime_secs: None,
        }
    }
}

/// Everything one execution of a step needs: its bound data, resources,
/// parameters and working directory. Immutable once built.
#[derive(Clone)]
pub struct TaskContext {
    id: TaskId,
    step_id: String,
    step_type: String,
    inputs: HashMap<String, Data>,
    outputs: HashMap<String, Data>,
    resources: Resources,
    work_dir: PathBuf,
    params: HashMap<String, String>,
    cancellation: CancellationToken,
    store: Option<Arc<dyn ArtifactStore>>,
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("id", &self.id)
            .field("step_id", &self.step_id)
            .field("step_type", &self.step_type)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("resources", &self.resources)
            .field("work_dir", &self.work_dir)
            .field("params", &self.params)
            .field("has_store", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

impl TaskContext {
    pub fn builder(
        step_id: impl Into<String>,
        step_type: impl Into<String>,
        input_ports: &Ports,
        output_ports: &Ports,
    ) -> TaskContextBuilder {
        TaskContextBuilder {
            step_id: step_id.into(),
            step_type: step_type.into(),
            input_ports: input_ports.clone(),
            output_ports: output_ports.clone(),
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            resources: Resources::default(),
            work_dir: std::env::temp_dir(),
            params: HashMap::new(),
            cancellation: CancellationToken::new(),
            store: None,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    pub fn step_type(&self) -> &str {
        &self.step_type
    }

    pub fn inputs(&self) -> &HashMap<String, Data> {
        &self.inputs
    }

    pub fn outputs(&self) -> &HashMap<String, Data> {
        &self.outputs
    }

    pub fn input(&self, port: &str) -> Option<&Data> {
        self.inputs.get(port)
    }

    pub fn output(&self, port: &str) -> Option<&Data> {
        self.outputs.get(port)
    }

    /// Bound input data, or `MissingBinding`.
    pub fn require_input(&self, port: &str) -> Result<&Data, ConfigError> {
        self.inputs
            .get(port)
            .ok_or_else(|| ConfigError::MissingBinding(port.to_string()))
    }

    pub fn require_output(&self, port: &str) -> Result<&Data, ConfigError> {
        self.outputs
            .get(port)
            .ok_or_else(|| ConfigError::MissingBinding(port.to_string()))
    }

    pub fn resources(&self) -> &Resources {
        &self.resources
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Scratch space owned by this task.
    pub fn temp_dir(&self) -> PathBuf {
        self.work_dir.join(format!("tmp-{}", self.id))
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Artifact cache to consult before rebuilding derived data, when the
    /// runtime provides one.
    pub fn store(&self) -> Option<&dyn ArtifactStore> {
        self.store.as_deref()
    }

    /// Serialisable description of the task, written next to cluster jobs.
    pub fn descriptor(&self) -> TaskDescriptor {
        let references = |bound: &HashMap<String, Data>| -> BTreeMap<String, Vec<String>> {
            bound
                .iter()
                .map(|(port, data)| (port.clone(), data.references()))
                .collect()
        };
        TaskDescriptor {
            id: self.id,
            step_id: self.step_id.clone(),
            step_type: self.step_type.clone(),
            inputs: references(&self.inputs),
            outputs: references(&self.outputs),
            resources: self.resources.clone(),
            work_dir: self.work_dir.clone(),
            params: self.params.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        }
    }
}

/// On-disk form of a `TaskContext`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub id: TaskId,
    pub step_id: String,
    pub step_type: String,
    pub inputs: BTreeMap<String, Vec<String>>,
    pub outputs: BTreeMap<String, Vec<String>>,
    pub resources: Resources,
    pub work_dir: PathBuf,
    pub params: BTreeMap<String, String>,
}

pub struct TaskContextBuilder {
    step_id: String,
    step_type: String,
    input_ports: Ports,
    output_ports: Ports,
    inputs: HashMap<String, Data>,
    outputs: HashMap<String, Data>,
    resources: Resources,
    work_dir: PathBuf,
    params: HashMap<String, String>,
    cancellation: CancellationToken,
    store: Option<Arc<dyn ArtifactStore>>,
}

impl TaskContextBuilder {
    pub fn input(mut self, port: impl Into<String>, data: Data) -> Self {
        self.inputs.insert(port.into(), data);
        self
    }

    pub fn output(mut self, port: impl Into<String>, data: Data) -> Self {
        self.outputs.insert(port.into(), data);
        self
    }

    pub fn resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    pub fn work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn params(mut self, params: HashMap<String, String>) -> Self {
        self.params.extend(params);
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Check every binding against its port and produce the context.
    /// Every port that is not optional, input or output, must be bound.
    pub fn build(self) -> Result<TaskContext, ConfigError> {
        for (name, data) in &self.inputs {
            check_binding(self.input_ports.get_port(name)?, data)?;
        }
        for port in self.input_ports.iter() {
            if port.is_required() && !self.inputs.contains_key(port.name()) {
                return Err(ConfigError::MissingBinding(port.name().to_string()));
            }
        }

        for (name, data) in &self.outputs {
            check_binding(self.output_ports.get_port(name)?, data)?;
            if let Some(file) = data.files().iter().find(|f| !f.is_writable()) {
                return Err(ConfigError::NotWritable {
                    port: name.clone(),
                    protocol: file.protocol_name().to_string(),
                });
            }
        }
        for port in self.output_ports.iter() {
            if port.is_required() && !self.outputs.contains_key(port.name()) {
                return Err(ConfigError::MissingBinding(port.name().to_string()));
            }
        }

        Ok(TaskContext {
            id: Uuid::new_v4(),
            step_id: self.step_id,
            step_type: self.step_type,
            inputs: self.inputs,
            outputs: self.outputs,
            resources: self.resources,
            work_dir: self.work_dir,
            params: self.params,
            cancellation: self.cancellation,
            store: self.store,
        })
    }
}

fn check_binding(port: &Port, data: &Data) -> Result<(), ConfigError> {
    if data.format().name() != port.format().name() {
        return Err(ConfigError::FormatMismatch {
            port: port.name().to_string(),
            expected: port.format().name().to_string(),
            actual: data.format().name().to_string(),
        });
    }

    let (min, max) = port.accepted_files();
    if data.len() < min || data.len() > max {
        let expected = if max == usize::MAX {
            format!("at least {}", min)
        } else if min == max {
            min.to_string()
        } else {
            format!("{} to {}", min, max)
        };
        return Err(ConfigError::Cardinality {
            port: port.name().to_string(),
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}
