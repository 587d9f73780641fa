use crate::Resources;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Complete pipeline definition, as loaded from JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    /// Source data: step id -> input port -> references.
    #[serde(default)]
    pub inputs: BTreeMap<String, BTreeMap<String, Vec<String>>>,
    #[serde(default)]
    pub settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            steps: Vec::new(),
            connections: Vec::new(),
            inputs: BTreeMap::new(),
            settings: PipelineSettings::default(),
        }
    }

    pub fn add_step(&mut self, step: StepSpec) -> String {
        let id = step.id.clone();
        self.steps.push(step);
        id
    }

    pub fn connect(
        &mut self,
        from_step: impl Into<String>,
        from_port: impl Into<String>,
        to_step: impl Into<String>,
        to_port: impl Into<String>,
    ) {
        self.connections.push(Connection {
            from_step: from_step.into(),
            from_port: from_port.into(),
            to_step: to_step.into(),
            to_port: to_port.into(),
        });
    }

    pub fn bind_input<I, S>(&mut self, step: impl Into<String>, port: impl Into<String>, references: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs
            .entry(step.into())
            .or_default()
            .insert(port.into(), references.into_iter().map(Into::into).collect());
    }

    pub fn find_step(&self, id: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// Step specification in a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    pub id: String,
    pub step_type: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
    #[serde(default)]
    pub resources: Resources,
}

impl StepSpec {
    pub fn new(id: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            step_type: step_type.into(),
            params: HashMap::new(),
            resources: Resources::default(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }
}

/// Output port of one step feeding the input port of another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub from_step: String,
    pub from_port: String,
    pub to_step: String,
    pub to_port: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default)]
    pub on_error: ErrorHandling,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorHandling {
    /// Submit nothing new after the first failure.
    #[default]
    StopPipeline,
    /// Keep running branches that do not depend on a failed step.
    ContinueOnError,
}
