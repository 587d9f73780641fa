//! Static checks on a pipeline before anything is submitted.

use crate::registry::StepRegistry;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use pipecore::{validate_connection, ConfigError, FormatRegistry, Pipeline, Step};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A pipeline whose steps exist, are configured and are wired correctly.
pub struct ValidatedPipeline {
    /// Step ids in topological order
    pub order: Vec<String>,
    pub steps: HashMap<String, Arc<dyn Step>>,
    /// Upstream step ids per step
    pub dependencies: HashMap<String, Vec<String>>,
}

impl ValidatedPipeline {
    pub fn step(&self, id: &str) -> Option<&Arc<dyn Step>> {
        self.steps.get(id)
    }
}

/// Instantiate every step and check the wiring.
///
/// Every step type must be registered, every connection must join an
/// existing output port to an existing input port of the same format, no
/// input port may be fed twice, every required input must be fed and the
/// graph must be acyclic.
pub fn validate_pipeline(
    pipeline: &Pipeline,
    registry: &StepRegistry,
    formats: &FormatRegistry,
) -> Result<ValidatedPipeline, ConfigError> {
    let mut steps: HashMap<String, Arc<dyn Step>> = HashMap::new();
    for spec in &pipeline.steps {
        if steps.contains_key(&spec.id) {
            return Err(ConfigError::Invalid(format!("Duplicate step id: {}", spec.id)));
        }
        let step = registry.create_step(&spec.step_type, &spec.params, formats)?;
        steps.insert(spec.id.clone(), step);
    }

    let mut graph = DiGraph::<String, ()>::new();
    let index: HashMap<String, _> = pipeline
        .steps
        .iter()
        .map(|spec| (spec.id.clone(), graph.add_node(spec.id.clone())))
        .collect();

    let mut fed: HashSet<(String, String)> = HashSet::new();
    let mut dependencies: HashMap<String, Vec<String>> = HashMap::new();

    for conn in &pipeline.connections {
        let from = steps
            .get(&conn.from_step)
            .ok_or_else(|| ConfigError::StepNotFound(conn.from_step.clone()))?;
        let to = steps
            .get(&conn.to_step)
            .ok_or_else(|| ConfigError::StepNotFound(conn.to_step.clone()))?;

        let output = from.output_ports().get_port(&conn.from_port)?;
        let input = to.input_ports().get_port(&conn.to_port)?;
        validate_connection(output, input)?;

        if !fed.insert((conn.to_step.clone(), conn.to_port.clone())) {
            return Err(ConfigError::InvalidConnection(format!(
                "{}.{} is fed more than once",
                conn.to_step, conn.to_port
            )));
        }

        graph.add_edge(index[&conn.from_step], index[&conn.to_step], ());
        let upstream = dependencies.entry(conn.to_step.clone()).or_default();
        if !upstream.contains(&conn.from_step) {
            upstream.push(conn.from_step.clone());
        }
    }

    for (step_id, ports) in &pipeline.inputs {
        let step = steps
            .get(step_id)
            .ok_or_else(|| ConfigError::StepNotFound(step_id.clone()))?;
        for port in ports.keys() {
            step.input_ports().get_port(port)?;
            if !fed.insert((step_id.clone(), port.clone())) {
                return Err(ConfigError::InvalidConnection(format!(
                    "{}.{} is both connected and bound to pipeline input",
                    step_id, port
                )));
            }
        }
    }

    for spec in &pipeline.steps {
        for port in steps[&spec.id].input_ports().iter() {
            if port.is_required() && !fed.contains(&(spec.id.clone(), port.name().to_string())) {
                return Err(ConfigError::MissingBinding(format!(
                    "{}.{}",
                    spec.id,
                    port.name()
                )));
            }
        }
    }

    let order = toposort(&graph, None)
        .map_err(|_| ConfigError::CyclicDependency)?
        .into_iter()
        .map(|idx| graph[idx].clone())
        .collect();

    Ok(ValidatedPipeline {
        order,
        steps,
        dependencies,
    })
}
