//! Cluster scheduler.
//!
//! Tasks are submitted to a batch system through a per-system wrapper
//! script (see [`wrapper::Wrapper`]). A single ticker polls every
//! outstanding job each `poll_interval` and turns batch states into task
//! states. Each live job has a stop task in the [`EmergencyStopRegistry`]
//! so an abnormal shutdown can kill it.

mod batch;
mod wrapper;

pub use batch::{BatchSystem, JobState};
pub use wrapper::{SubmitRequest, Wrapper};

use super::{Completion, SchedulerError, StateTable, Task, TaskHandle, TaskScheduler, TaskState};
use crate::emergency::{EmergencyStopRegistry, StopKey, StopTask};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use pipecore::{
    ConfigError, EventBus, ExecutionEvent, ExternalJobError, TaskError, TaskId, TaskResult, TaskStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const NAME: &str = "cluster";

/// File holding the serialised task next to the job's working directory.
pub const TASK_FILE: &str = "task.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub batch_system: BatchSystem,
    /// Directory holding `<system>_wrapper` scripts.
    pub wrapper_dir: PathBuf,
    pub poll_interval: Duration,
    /// Upper bound on each wrapper invocation.
    pub command_timeout: Duration,
    /// Consecutive failed status queries before a job is declared failed.
    pub max_poll_failures: u32,
    /// Slack past the walltime before an unrecognized job state counts as
    /// failed.
    pub terminal_grace: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            batch_system: BatchSystem::Slurm,
            wrapper_dir: PathBuf::from("wrappers"),
            poll_interval: Duration::from_secs(2),
            command_timeout: Duration::from_secs(30),
            max_poll_failures: 3,
            terminal_grace: Duration::from_secs(60),
        }
    }
}

/// Kills one job through the wrapper.
struct KillJob {
    key: StopKey,
    wrapper: Arc<Wrapper>,
}

#[async_trait]
impl StopTask for KillJob {
    fn key(&self) -> StopKey {
        self.key.clone()
    }

    async fn stop(&self) -> Result<(), ExternalJobError> {
        self.wrapper.kill(&self.key.job_id).await
    }
}

struct TrackedJob {
    job_id: String,
    completion: Completion,
    status: TaskStatus,
    submitted_at: Instant,
    walltime: Option<Duration>,
    poll_failures: u32,
    last_state: Option<String>,
}

struct Held {
    task: Task,
    completion: Completion,
}

struct Inner {
    scope: Uuid,
    config: ClusterConfig,
    wrapper: Arc<Wrapper>,
    stop_registry: EmergencyStopRegistry,
    events: EventBus,
    states: StateTable,
    jobs: Mutex<Vec<TrackedJob>>,
    /// Jobs taken out of `jobs` by the poll round in progress.
    polling: AtomicUsize,
    held: Mutex<VecDeque<Held>>,
    paused: AtomicBool,
    stopped: AtomicBool,
    shutdown: CancellationToken,
}

pub struct ClusterScheduler {
    inner: Arc<Inner>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterScheduler {
    /// Must be called inside a tokio runtime; the poll ticker starts
    /// immediately.
    pub fn new(
        config: ClusterConfig,
        events: EventBus,
        stop_registry: EmergencyStopRegistry,
    ) -> Result<Self, ConfigError> {
        if config.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("poll interval must be positive".to_string()));
        }
        if config.max_poll_failures == 0 {
            return Err(ConfigError::Invalid(
                "max poll failures must be at least one".to_string(),
            ));
        }

        let wrapper = Arc::new(Wrapper::new(
            &config.wrapper_dir,
            config.batch_system,
            config.command_timeout,
        ));
        let inner = Arc::new(Inner {
            scope: Uuid::new_v4(),
            config,
            wrapper,
            stop_registry,
            events,
            states: StateTable::default(),
            jobs: Mutex::new(Vec::new()),
            polling: AtomicUsize::new(0),
            held: Mutex::new(VecDeque::new()),
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        let ticker = tokio::spawn(ticker_loop(inner.clone()));
        tracing::info!(
            "Cluster scheduler started for {} ({})",
            inner.config.batch_system,
            inner.wrapper.program().display()
        );
        Ok(Self {
            inner,
            ticker: Mutex::new(Some(ticker)),
        })
    }

    pub fn batch_system(&self) -> BatchSystem {
        self.inner.config.batch_system
    }

    /// Identifier scoping this scheduler's emergency stop keys.
    pub fn scope(&self) -> Uuid {
        self.inner.scope
    }

    /// Number of jobs submitted and not yet finished.
    pub async fn outstanding(&self) -> usize {
        let jobs = self.inner.jobs.lock().await;
        jobs.len() + self.inner.polling.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskScheduler for ClusterScheduler {
    fn name(&self) -> &str {
        NAME
    }

    async fn submit(&self, task: Task) -> Result<TaskHandle, SchedulerError> {
        // `paused` and `stopped` only change under the `held` lock, so a
        // held task is always seen by the next resume or stop.
        let mut held = self.inner.held.lock().await;
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(SchedulerError::Stopped);
        }
        let (completion, handle) = Completion::new(task.id(), task.step_id());
        self.inner.states.track(&completion);

        self.inner.events.emit(ExecutionEvent::TaskSubmitted {
            task_id: task.id(),
            step_id: task.step_id().to_string(),
            scheduler: NAME.to_string(),
            timestamp: Utc::now(),
        });

        if self.inner.paused.load(Ordering::SeqCst) {
            tracing::debug!("Holding task {} while paused", task.id());
            held.push_back(Held { task, completion });
        } else {
            drop(held);
            dispatch(&self.inner, task, completion).await;
        }
        Ok(handle)
    }

    fn state(&self, task_id: TaskId) -> Option<TaskState> {
        self.inner.states.get(task_id)
    }

    async fn pause(&self) {
        let _held = self.inner.held.lock().await;
        if !self.inner.paused.swap(true, Ordering::SeqCst) {
            tracing::info!("Cluster scheduler paused");
            self.inner.events.emit(ExecutionEvent::SchedulerPaused {
                scheduler: NAME.to_string(),
                timestamp: Utc::now(),
            });
        }
    }

    async fn resume(&self) {
        let held: Vec<Held> = {
            let mut held = self.inner.held.lock().await;
            if !self.inner.paused.swap(false, Ordering::SeqCst) {
                return;
            }
            held.drain(..).collect()
        };
        tracing::info!("Cluster scheduler resumed");
        self.inner.events.emit(ExecutionEvent::SchedulerResumed {
            scheduler: NAME.to_string(),
            timestamp: Utc::now(),
        });

        for Held { task, completion } in held {
            dispatch(&self.inner, task, completion).await;
        }
    }

    fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        let held: Vec<Held> = {
            let mut held = self.inner.held.lock().await;
            if self.inner.stopped.swap(true, Ordering::SeqCst) {
                return;
            }
            held.drain(..).collect()
        };
        tracing::info!("Stopping cluster scheduler");
        self.inner.shutdown.cancel();
        if let Some(ticker) = self.ticker.lock().await.take() {
            let _ = ticker.await;
        }

        let mut abandoned = held.len();
        for Held { task, completion } in held {
            completion.finish(TaskResult::failed(task.id(), task.step_id(), &TaskError::Cancelled));
        }

        let jobs = std::mem::take(&mut *self.inner.jobs.lock().await);
        abandoned += jobs.len();
        for job in jobs {
            if let Err(e) = self.inner.wrapper.kill(&job.job_id).await {
                tracing::error!("Failed to kill job {}: {}", job.job_id, e);
            }
            self.inner
                .stop_registry
                .remove(&StopKey::new(self.inner.scope, job.job_id.clone()));
            let result = TaskResult::from_status(job.status, Some(&TaskError::Cancelled));
            job.completion.finish(result);
        }

        self.inner.events.emit(ExecutionEvent::SchedulerStopped {
            scheduler: NAME.to_string(),
            abandoned,
            timestamp: Utc::now(),
        });
        tracing::info!("Cluster scheduler stopped ({} task(s) cancelled)", abandoned);
    }
}

impl Drop for ClusterScheduler {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

/// Submit one task to the batch system. Failures are reported through the
/// task's result, not to the caller.
async fn dispatch(inner: &Inner, task: Task, completion: Completion) {
    let task_id = task.id();
    let step_id = task.step_id().to_string();
    let status = TaskStatus::new(task_id, step_id.clone());

    match submit_job(inner, &task).await {
        Ok(job_id) => {
            let key = StopKey::new(inner.scope, job_id.clone());
            inner.stop_registry.add(Arc::new(KillJob {
                key,
                wrapper: inner.wrapper.clone(),
            }));

            tracing::info!("Task {} ({}) submitted as job {}", task_id, step_id, job_id);
            inner.events.emit(ExecutionEvent::JobSubmitted {
                task_id,
                job_id: job_id.clone(),
                batch_system: inner.config.batch_system.to_string(),
                timestamp: Utc::now(),
            });

            // `stop` sets `stopped` before it empties `jobs`. Checking under
            // the lock means a job is either drained by `stop` or never
            // tracked at all.
            let mut jobs = inner.jobs.lock().await;
            if inner.stopped.load(Ordering::SeqCst) {
                drop(jobs);
                tracing::warn!("Scheduler stopped while job {} was being submitted; killing it", job_id);
                if let Err(e) = inner.wrapper.kill(&job_id).await {
                    tracing::error!("Failed to kill job {}: {}", job_id, e);
                }
                inner.stop_registry.remove(&StopKey::new(inner.scope, job_id));
                completion.finish(TaskResult::from_status(status, Some(&TaskError::Cancelled)));
                return;
            }
            jobs.push(TrackedJob {
                job_id,
                completion,
                status,
                submitted_at: Instant::now(),
                walltime: task.context.resources().walltime_secs.map(Duration::from_secs),
                poll_failures: 0,
                last_state: None,
            });
        }
        Err(e) => {
            tracing::warn!("Submitting task {} ({}) failed: {}", task_id, step_id, e);
            completion.finish(TaskResult::from_status(status, Some(&e)));
        }
    }
}

async fn submit_job(inner: &Inner, task: &Task) -> Result<String, TaskError> {
    let context = &task.context;
    let command = task
        .step
        .command_line(context)
        .filter(|command| !command.is_empty())
        .ok_or_else(|| ConfigError::NotClusterCapable(context.step_type().to_string()))?;

    let job_dir = context.work_dir().join(format!("task-{}", context.id()));
    tokio::fs::create_dir_all(&job_dir).await?;
    let descriptor = serde_json::to_vec_pretty(&context.descriptor())
        .map_err(|e| TaskError::Failed(format!("cannot serialise task: {}", e)))?;
    tokio::fs::write(job_dir.join(TASK_FILE), descriptor).await?;

    let resources = context.resources();
    let request = SubmitRequest {
        name: format!("{}-{}", context.step_id(), context.id()),
        cpus: resources.cpus,
        memory_mb: resources.memory_mb,
        walltime_secs: resources.walltime_secs,
        work_dir: job_dir,
        command,
    };
    Ok(inner.wrapper.submit(&request).await?)
}

async fn ticker_loop(inner: Arc<Inner>) {
    let mut interval = tokio::time::interval(inner.config.poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        poll_jobs(&inner).await;
    }
    tracing::debug!("Cluster poll ticker exiting");
}

/// Poll every outstanding job concurrently. The job list is taken out of
/// the lock for the round so submissions are not blocked by slow status
/// queries; jobs pushed meanwhile are merged back with the survivors.
async fn poll_jobs(inner: &Inner) {
    let jobs = {
        let mut jobs = inner.jobs.lock().await;
        inner.polling.store(jobs.len(), Ordering::SeqCst);
        std::mem::take(&mut *jobs)
    };
    if jobs.is_empty() {
        return;
    }

    let polled = join_all(jobs.into_iter().map(|job| poll_job(inner, job))).await;
    let mut jobs = inner.jobs.lock().await;
    jobs.extend(polled.into_iter().flatten());
    inner.polling.store(0, Ordering::SeqCst);
}

/// Query one job. Returns the job if it is still outstanding.
async fn poll_job(inner: &Inner, mut job: TrackedJob) -> Option<TrackedJob> {
    let task_id = job.completion.id();
    let raw = match inner.wrapper.status(&job.job_id).await {
        Ok(raw) => {
            job.poll_failures = 0;
            raw
        }
        Err(e) => {
            job.poll_failures += 1;
            tracing::warn!(
                "Status query for job {} failed ({}/{}): {}",
                job.job_id,
                job.poll_failures,
                inner.config.max_poll_failures,
                e
            );
            if job.poll_failures >= inner.config.max_poll_failures {
                complete(inner, job, Some(TaskError::External(e)));
                return None;
            }
            return Some(job);
        }
    };

    if job.last_state.as_deref() != Some(raw.as_str()) {
        tracing::debug!("Job {} is {}", job.job_id, raw);
        inner.events.emit(ExecutionEvent::JobStateChanged {
            task_id,
            job_id: job.job_id.clone(),
            state: raw.clone(),
            timestamp: Utc::now(),
        });
        job.status.set_description(format!("job {}: {}", job.job_id, raw));
        job.last_state = Some(raw.clone());
    }

    let job_state = inner.config.batch_system.parse_state(&raw);
    let next = job_state.task_state(
        job.submitted_at.elapsed(),
        job.walltime,
        inner.config.terminal_grace,
    );

    match next {
        TaskState::Submitted => Some(job),
        TaskState::Running => {
            if job.completion.set_state(TaskState::Running) {
                inner.events.emit(ExecutionEvent::TaskStarted {
                    task_id,
                    step_id: job.completion.step_id().to_string(),
                    timestamp: Utc::now(),
                });
            }
            Some(job)
        }
        TaskState::Succeeded => {
            complete(inner, job, None);
            None
        }
        TaskState::Failed => {
            let state = match job_state {
                JobState::Unrecognized(raw) => {
                    format!("'{}' past its expected lifetime", raw)
                }
                _ => raw,
            };
            let error = TaskError::External(ExternalJobError::JobFailed {
                job_id: job.job_id.clone(),
                state,
            });
            complete(inner, job, Some(error));
            None
        }
    }
}

fn complete(inner: &Inner, job: TrackedJob, error: Option<TaskError>) {
    let TrackedJob {
        job_id,
        completion,
        status,
        ..
    } = job;
    inner.stop_registry.remove(&StopKey::new(inner.scope, job_id.clone()));

    let result = TaskResult::from_status(status, error.as_ref());
    match &result.error {
        Some(error) => tracing::warn!("Job {} failed: {}", job_id, error),
        None => tracing::info!("Job {} completed in {}ms", job_id, result.duration_ms),
    }
    inner.events.emit(ExecutionEvent::TaskCompleted {
        task_id: result.task_id,
        step_id: result.step_id.clone(),
        success: result.success,
        duration_ms: result.duration_ms,
        error: result.error.clone(),
        timestamp: Utc::now(),
    });
    completion.finish(result);
}
