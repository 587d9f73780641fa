use crate::emergency::EmergencyStopRegistry;
use crate::registry::StepRegistry;
use crate::runner::{PipelineRunner, RunSummary};
use crate::scheduler::{BatchSystem, ClusterConfig, ClusterScheduler, LocalScheduler, TaskScheduler};
use crate::storage::{ArtifactStore, DirectoryStore, MemoryStore};
use crate::validate::{validate_pipeline, ValidatedPipeline};
use pipecore::task::millis;
use pipecore::{ConfigError, DataRegistry, EventBus, ExecutionEvent, PipeError, Pipeline, ProtocolSettings};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    #[default]
    Local,
    Cluster,
}

/// Configuration for the runtime, loaded from JSON. Every field has a
/// default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub scheduler: SchedulerKind,
    /// Local worker pool size
    pub threads: usize,
    pub stop_timeout_ms: u64,
    pub batch_system: BatchSystem,
    pub wrapper_dir: PathBuf,
    pub poll_interval_ms: u64,
    pub command_timeout_ms: u64,
    pub max_poll_failures: u32,
    pub terminal_grace_ms: u64,
    pub work_dir: PathBuf,
    /// Root of the artifact cache; in-memory when unset
    pub storage_dir: Option<PathBuf>,
    pub distributed_command: PathBuf,
    pub object_endpoint: String,
    pub event_buffer_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let protocols = ProtocolSettings::default();
        let cluster = ClusterConfig::default();
        Self {
            scheduler: SchedulerKind::Local,
            threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            stop_timeout_ms: 5000,
            batch_system: cluster.batch_system,
            wrapper_dir: cluster.wrapper_dir,
            poll_interval_ms: millis(cluster.poll_interval),
            command_timeout_ms: millis(cluster.command_timeout),
            max_poll_failures: cluster.max_poll_failures,
            terminal_grace_ms: millis(cluster.terminal_grace),
            work_dir: PathBuf::from("work"),
            storage_dir: None,
            distributed_command: protocols.distributed_command,
            object_endpoint: protocols.object_endpoint,
            event_buffer_size: 1000,
        }
    }
}

impl RuntimeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PipeError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: RuntimeConfig = serde_json::from_str(&content)?;
        config.validate()?;
        tracing::debug!("Loaded runtime configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::InvalidThreadCount);
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be positive".to_string()));
        }
        if self.command_timeout_ms == 0 {
            return Err(ConfigError::Invalid("command_timeout_ms must be positive".to_string()));
        }
        if self.max_poll_failures == 0 {
            return Err(ConfigError::Invalid("max_poll_failures must be positive".to_string()));
        }
        if self.event_buffer_size == 0 {
            return Err(ConfigError::Invalid("event_buffer_size must be positive".to_string()));
        }
        Ok(())
    }

    pub fn cluster(&self) -> ClusterConfig {
        ClusterConfig {
            batch_system: self.batch_system,
            wrapper_dir: self.wrapper_dir.clone(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            command_timeout: Duration::from_millis(self.command_timeout_ms),
            max_poll_failures: self.max_poll_failures,
            terminal_grace: Duration::from_millis(self.terminal_grace_ms),
        }
    }

    pub fn protocols(&self) -> ProtocolSettings {
        ProtocolSettings {
            distributed_command: self.distributed_command.clone(),
            object_endpoint: self.object_endpoint.clone(),
            command_timeout: Duration::from_millis(self.command_timeout_ms),
        }
    }
}

/// Main runtime: step registry, data registry, scheduler, event bus,
/// emergency-stop registry and artifact cache wired from one
/// `RuntimeConfig`.
pub struct PipeRuntime {
    config: RuntimeConfig,
    steps: Arc<StepRegistry>,
    data: Arc<DataRegistry>,
    scheduler: Arc<dyn TaskScheduler>,
    events: EventBus,
    stop_registry: EmergencyStopRegistry,
    store: Arc<dyn ArtifactStore>,
}

impl PipeRuntime {
    /// Build a runtime. Must be called inside a tokio runtime since the
    /// scheduler starts its workers immediately.
    pub fn new(config: RuntimeConfig, steps: StepRegistry) -> Result<Self, PipeError> {
        Self::with_stop_registry(config, steps, EmergencyStopRegistry::new())
    }

    /// Build a runtime registering external jobs in `stop_registry`.
    pub fn with_stop_registry(
        config: RuntimeConfig,
        steps: StepRegistry,
        stop_registry: EmergencyStopRegistry,
    ) -> Result<Self, PipeError> {
        config.validate()?;

        let events = EventBus::new(config.event_buffer_size);
        let data = Arc::new(DataRegistry::standard(&config.protocols()));
        let scheduler: Arc<dyn TaskScheduler> = match config.scheduler {
            SchedulerKind::Local => Arc::new(LocalScheduler::new(
                config.threads,
                Duration::from_millis(config.stop_timeout_ms),
                events.clone(),
            )?),
            SchedulerKind::Cluster => Arc::new(ClusterScheduler::new(
                config.cluster(),
                events.clone(),
                stop_registry.clone(),
            )?),
        };
        let store: Arc<dyn ArtifactStore> = match &config.storage_dir {
            Some(dir) => Arc::new(DirectoryStore::new(dir, data.clone())),
            None => Arc::new(MemoryStore::new()),
        };

        Ok(Self {
            config,
            steps: Arc::new(steps),
            data,
            scheduler,
            events,
            stop_registry,
            store,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn steps(&self) -> &Arc<StepRegistry> {
        &self.steps
    }

    pub fn data(&self) -> &Arc<DataRegistry> {
        &self.data
    }

    pub fn scheduler(&self) -> &Arc<dyn TaskScheduler> {
        &self.scheduler
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    pub fn stop_registry(&self) -> &EmergencyStopRegistry {
        &self.stop_registry
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.events
    }

    pub fn validate(&self, pipeline: &Pipeline) -> Result<ValidatedPipeline, ConfigError> {
        validate_pipeline(pipeline, &self.steps, self.data.formats())
    }

    pub fn runner(&self) -> PipelineRunner {
        PipelineRunner::new(
            self.steps.clone(),
            self.data.clone(),
            self.scheduler.clone(),
            self.events.clone(),
            &self.config.work_dir,
        )
        .with_store(self.store.clone())
    }

    pub async fn run(&self, pipeline: &Pipeline) -> Result<RunSummary, PipeError> {
        self.runner().run(pipeline).await
    }

    /// Stop the scheduler. Outstanding tasks are failed.
    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_from_partial_json() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{"scheduler": "cluster", "batch_system": "lsf", "threads": 3}"#).unwrap();
        assert_eq!(config.scheduler, SchedulerKind::Cluster);
        assert_eq!(config.batch_system, BatchSystem::Lsf);
        assert_eq!(config.threads, 3);
        assert_eq!(config.stop_timeout_ms, 5000);
        assert_eq!(config.poll_interval_ms, 2000);
        assert_eq!(config.command_timeout_ms, 30000);
        assert_eq!(config.max_poll_failures, 3);
        assert_eq!(config.terminal_grace_ms, 60000);
        assert_eq!(config.event_buffer_size, 1000);
        assert_eq!(config.distributed_command, PathBuf::from("hdfs"));
    }

    #[test]
    fn test_zero_threads_rejected() {
        let config = RuntimeConfig {
            threads: 0,
            ..RuntimeConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidThreadCount));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"work_dir": "/scratch/runs", "storage_dir": "/scratch/cache"}"#).unwrap();

        let config = RuntimeConfig::load(&path).unwrap();
        assert_eq!(config.work_dir, PathBuf::from("/scratch/runs"));
        assert_eq!(config.storage_dir, Some(PathBuf::from("/scratch/cache")));
        assert_eq!(config.scheduler, SchedulerKind::Local);

        std::fs::write(&path, r#"{"threads": 0}"#).unwrap();
        assert!(RuntimeConfig::load(&path).is_err());
    }
}
