use crate::registry::StepRegistry;
use crate::requirements::ensure_requirements;
use crate::scheduler::{Task, TaskHandle, TaskScheduler};
use crate::validate::{validate_pipeline, ValidatedPipeline};
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use pipecore::task::millis;
use pipecore::{
    ArtifactStore, ConfigError, Data, DataRegistry, ErrorHandling, EventBus, ExecutionEvent, LogProgress, PipeError,
    Pipeline, ProgressSink, RunId, Step, TaskContext, TaskError, TaskResult,
};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Outcome of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub pipeline: String,
    /// Results in completion order
    pub results: Vec<TaskResult>,
    /// Steps never submitted because an upstream step failed
    pub skipped: Vec<String>,
    pub duration_ms: u64,
}

impl RunSummary {
    pub fn success(&self) -> bool {
        self.skipped.is_empty() && self.results.iter().all(|r| r.success)
    }

    pub fn result(&self, step_id: &str) -> Option<&TaskResult> {
        self.results.iter().find(|r| r.step_id == step_id)
    }

    pub fn failed(&self) -> impl Iterator<Item = &TaskResult> {
        self.results.iter().filter(|r| !r.success)
    }
}

/// Runs a pipeline on a scheduler, one task per step.
///
/// Source inputs come from the pipeline's `inputs` map; every output port
/// gets a generated file under `<work_dir>/<run id>/<step id>/`. A step is
/// submitted once every upstream step has succeeded and receives their
/// output data on its connected ports.
pub struct PipelineRunner {
    steps: Arc<StepRegistry>,
    data: Arc<DataRegistry>,
    scheduler: Arc<dyn TaskScheduler>,
    events: EventBus,
    work_dir: PathBuf,
    progress: Arc<dyn ProgressSink>,
    store: Option<Arc<dyn ArtifactStore>>,
}

impl PipelineRunner {
    pub fn new(
        steps: Arc<StepRegistry>,
        data: Arc<DataRegistry>,
        scheduler: Arc<dyn TaskScheduler>,
        events: EventBus,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            steps,
            data,
            scheduler,
            events,
            work_dir: work_dir.into(),
            progress: Arc::new(LogProgress),
            store: None,
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Hand `store` to every task this runner submits.
    pub fn with_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn scheduler(&self) -> &Arc<dyn TaskScheduler> {
        &self.scheduler
    }

    /// Validate, prepare and run `pipeline`.
    ///
    /// Configuration and dependency problems fail the whole run before
    /// anything is submitted. Failures of individual steps are reported in
    /// the summary.
    pub async fn run(&self, pipeline: &Pipeline) -> Result<RunSummary, PipeError> {
        let validated = validate_pipeline(pipeline, &self.steps, self.data.formats())?;
        for step_id in &validated.order {
            if let Some(step) = validated.step(step_id) {
                ensure_requirements(&step.requirements(), self.progress.as_ref()).await?;
            }
        }
        let sources = self.resolve_sources(pipeline, &validated)?;

        let run_id = Uuid::new_v4();
        let run_dir = self.work_dir.join(run_id.to_string());
        tokio::fs::create_dir_all(&run_dir).await?;

        let start = Instant::now();
        tracing::info!("Starting pipeline {} (run {})", pipeline.name, run_id);
        self.events.emit(ExecutionEvent::RunStarted {
            run_id,
            pipeline: pipeline.name.clone(),
            timestamp: Utc::now(),
        });

        let mut run = Run {
            pipeline,
            validated: &validated,
            sources,
            run_dir,
            produced: HashMap::new(),
            started: HashSet::new(),
            succeeded: HashSet::new(),
            results: Vec::new(),
        };
        self.drive(&mut run).await;

        let skipped: Vec<String> = validated
            .order
            .iter()
            .filter(|id| !run.started.contains(*id))
            .cloned()
            .collect();
        let summary = RunSummary {
            run_id,
            pipeline: pipeline.name.clone(),
            results: run.results,
            skipped,
            duration_ms: millis(start.elapsed()),
        };

        if summary.success() {
            tracing::info!("Pipeline {} completed in {}ms", pipeline.name, summary.duration_ms);
        } else {
            tracing::error!(
                "Pipeline {} failed: {} step(s) failed, {} skipped",
                pipeline.name,
                summary.failed().count(),
                summary.skipped.len()
            );
        }
        self.events.emit(ExecutionEvent::RunCompleted {
            run_id,
            success: summary.success(),
            duration_ms: summary.duration_ms,
            timestamp: Utc::now(),
        });
        Ok(summary)
    }

    fn resolve_sources(
        &self,
        pipeline: &Pipeline,
        validated: &ValidatedPipeline,
    ) -> Result<HashMap<String, HashMap<String, Data>>, ConfigError> {
        let mut sources: HashMap<String, HashMap<String, Data>> = HashMap::new();
        for (step_id, ports) in &pipeline.inputs {
            let step = validated
                .step(step_id)
                .ok_or_else(|| ConfigError::StepNotFound(step_id.clone()))?;
            for (port_name, references) in ports {
                let port = step.input_ports().get_port(port_name)?;
                let files = references
                    .iter()
                    .map(|reference| self.data.resolve(reference))
                    .collect::<Result<Vec<_>, _>>()?;
                let data = Data::new(port_name.clone(), port.format().clone(), files);
                sources
                    .entry(step_id.clone())
                    .or_default()
                    .insert(port_name.clone(), data);
            }
        }
        Ok(sources)
    }

    async fn drive(&self, run: &mut Run<'_>) {
        let mut running = FuturesUnordered::new();
        let mut pending_outputs: HashMap<String, HashMap<String, Data>> = HashMap::new();
        let mut halted = false;

        loop {
            if !halted {
                for step_id in run.ready() {
                    run.started.insert(step_id.clone());
                    match self.submit_step(run, &step_id).await {
                        Ok((handle, outputs)) => {
                            pending_outputs.insert(step_id.clone(), outputs);
                            running.push(async move {
                                let result = handle.wait().await;
                                (step_id, result)
                            });
                        }
                        Err(e) => {
                            tracing::error!("Cannot submit step {}: {}", step_id, e);
                            let result = TaskResult::failed(Uuid::new_v4(), step_id.clone(), &e);
                            run.record(result, None);
                            if run.pipeline.settings.on_error == ErrorHandling::StopPipeline {
                                halted = true;
                                break;
                            }
                        }
                    }
                }
            }

            let Some((step_id, result)) = running.next().await else {
                break;
            };
            if !result.success && run.pipeline.settings.on_error == ErrorHandling::StopPipeline {
                halted = true;
            }
            let outputs = pending_outputs.remove(&step_id);
            run.record(result, outputs);
        }
    }

    async fn submit_step(
        &self,
        run: &Run<'_>,
        step_id: &str,
    ) -> Result<(TaskHandle, HashMap<String, Data>), TaskError> {
        let step = run
            .validated
            .step(step_id)
            .ok_or_else(|| ConfigError::StepNotFound(step_id.to_string()))?;
        let spec = run
            .pipeline
            .find_step(step_id)
            .ok_or_else(|| ConfigError::StepNotFound(step_id.to_string()))?;

        let step_dir = run.run_dir.join(step_id);
        tokio::fs::create_dir_all(&step_dir).await?;

        let mut builder = TaskContext::builder(
            step_id,
            step.step_type(),
            step.input_ports(),
            step.output_ports(),
        )
        .resources(spec.resources.clone())
        .work_dir(&step_dir)
        .params(spec.params.clone());
        if let Some(store) = &self.store {
            builder = builder.store(store.clone());
        }

        for (port, data) in run.inputs_for(step_id) {
            builder = builder.input(port, data);
        }
        let outputs = self.output_bindings(step.as_ref(), &step_dir)?;
        for (port, data) in &outputs {
            builder = builder.output(port.clone(), data.clone());
        }

        let context = builder.build()?;
        let handle = self
            .scheduler
            .submit(Task::new(step.clone(), context))
            .await
            .map_err(|e| TaskError::Failed(e.to_string()))?;
        tracing::debug!("Submitted step {} as task {}", step_id, handle.id());
        Ok((handle, outputs))
    }

    fn output_bindings(&self, step: &dyn Step, step_dir: &Path) -> Result<HashMap<String, Data>, ConfigError> {
        let mut outputs = HashMap::new();
        for port in step.output_ports().iter() {
            let path = step_dir.join(format!("{}.{}", port.name(), port.format().default_extension()));
            let file = self.data.resolve(&path.to_string_lossy())?;
            outputs.insert(
                port.name().to_string(),
                Data::single(port.name(), port.format().clone(), file),
            );
        }
        Ok(outputs)
    }
}

/// Bookkeeping of one run.
struct Run<'a> {
    pipeline: &'a Pipeline,
    validated: &'a ValidatedPipeline,
    sources: HashMap<String, HashMap<String, Data>>,
    run_dir: PathBuf,
    /// Output data of succeeded steps
    produced: HashMap<String, HashMap<String, Data>>,
    started: HashSet<String>,
    succeeded: HashSet<String>,
    results: Vec<TaskResult>,
}

impl Run<'_> {
    /// Steps not yet started whose upstream steps all succeeded, in
    /// topological order.
    fn ready(&self) -> Vec<String> {
        self.validated
            .order
            .iter()
            .filter(|id| !self.started.contains(*id))
            .filter(|id| {
                self.validated
                    .dependencies
                    .get(*id)
                    .map(|deps| deps.iter().all(|dep| self.succeeded.contains(dep)))
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    fn inputs_for(&self, step_id: &str) -> Vec<(String, Data)> {
        let mut inputs: Vec<(String, Data)> = self
            .sources
            .get(step_id)
            .map(|ports| ports.iter().map(|(p, d)| (p.clone(), d.clone())).collect())
            .unwrap_or_default();

        for conn in self.pipeline.connections.iter().filter(|c| c.to_step == step_id) {
            if let Some(data) = self
                .produced
                .get(&conn.from_step)
                .and_then(|outputs| outputs.get(&conn.from_port))
            {
                inputs.push((conn.to_port.clone(), data.clone()));
            }
        }
        inputs
    }

    fn record(&mut self, result: TaskResult, outputs: Option<HashMap<String, Data>>) {
        if result.success {
            self.succeeded.insert(result.step_id.clone());
            if let Some(outputs) = outputs {
                self.produced.insert(result.step_id.clone(), outputs);
            }
        }
        self.results.push(result);
    }
}
