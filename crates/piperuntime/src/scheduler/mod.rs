//! Task schedulers.
//!
//! A scheduler accepts `Task`s and hands back a `TaskHandle` that yields
//! exactly one `TaskResult`. Two backends are provided: a local worker pool
//! and a cluster backend driving an external batch system.

pub mod cluster;
mod local;

pub use cluster::{BatchSystem, ClusterConfig, ClusterScheduler, JobState};
pub use local::LocalScheduler;

use async_trait::async_trait;
use dashmap::DashMap;
use pipecore::{ConfigError, PipeError, Step, TaskContext, TaskId, TaskResult};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::{oneshot, watch};

/// Lifecycle of a task: `Submitted -> Running -> {Succeeded, Failed}`.
/// A task may also fail straight from `Submitted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Submitted,
    Running,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }

    pub fn can_transition(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Submitted, Running) | (Submitted, Failed) | (Running, Succeeded) | (Running, Failed)
        )
    }
}

/// One execution of a step.
#[derive(Clone)]
pub struct Task {
    pub step: Arc<dyn Step>,
    pub context: Arc<TaskContext>,
}

impl Task {
    pub fn new(step: Arc<dyn Step>, context: TaskContext) -> Self {
        Self {
            step,
            context: Arc::new(context),
        }
    }

    pub fn id(&self) -> TaskId {
        self.context.id()
    }

    pub fn step_id(&self) -> &str {
        self.context.step_id()
    }
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Scheduler has been stopped")]
    Stopped,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<SchedulerError> for PipeError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::Stopped => PipeError::Execution("Scheduler has been stopped".to_string()),
            SchedulerError::Config(e) => PipeError::Config(e),
        }
    }
}

/// Consumer side of a submitted task.
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    step_id: String,
    state: watch::Receiver<TaskState>,
    result: oneshot::Receiver<TaskResult>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    pub fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    /// Receiver following state changes.
    pub fn watch_state(&self) -> watch::Receiver<TaskState> {
        self.state.clone()
    }

    /// Wait for the result. A producer that vanished without reporting
    /// yields an abandoned result.
    pub async fn wait(self) -> TaskResult {
        let id = self.id;
        let step_id = self.step_id;
        self.result
            .await
            .unwrap_or_else(|_| TaskResult::abandoned(id, step_id))
    }
}

/// Producer side of a submitted task. Dropping it without calling `finish`
/// delivers an abandoned result.
pub(crate) struct Completion {
    id: TaskId,
    step_id: String,
    state: watch::Sender<TaskState>,
    result: Option<oneshot::Sender<TaskResult>>,
}

impl Completion {
    pub(crate) fn new(task_id: TaskId, step_id: impl Into<String>) -> (Self, TaskHandle) {
        let step_id = step_id.into();
        let (state_tx, state_rx) = watch::channel(TaskState::Submitted);
        let (result_tx, result_rx) = oneshot::channel();
        (
            Self {
                id: task_id,
                step_id: step_id.clone(),
                state: state_tx,
                result: Some(result_tx),
            },
            TaskHandle {
                id: task_id,
                step_id,
                state: state_rx,
                result: result_rx,
            },
        )
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn step_id(&self) -> &str {
        &self.step_id
    }

    pub(crate) fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<TaskState> {
        self.state.subscribe()
    }

    /// Move to `next` if the transition is legal.
    pub(crate) fn set_state(&self, next: TaskState) -> bool {
        self.state.send_if_modified(|current| {
            if current.can_transition(next) {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn finish(mut self, result: TaskResult) {
        self.deliver(result);
    }

    fn deliver(&mut self, result: TaskResult) {
        let Some(sender) = self.result.take() else {
            return;
        };
        if result.success {
            self.set_state(TaskState::Running);
            self.set_state(TaskState::Succeeded);
        } else {
            self.set_state(TaskState::Failed);
        }
        // the handle may have been dropped
        let _ = sender.send(result);
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.result.is_some() {
            tracing::warn!("Task {} abandoned without a result", self.id);
            let result = TaskResult::abandoned(self.id, self.step_id.clone());
            self.deliver(result);
        }
    }
}

/// Finished tasks whose state stays queryable.
const RETAINED_FINISHED: usize = 1024;

/// Task state lookup shared by scheduler implementations.
///
/// Live tasks are always tracked. Once more than `retained` tasks are
/// tracked, the oldest finished ones are forgotten on the next `track`.
pub(crate) struct StateTable {
    states: DashMap<TaskId, watch::Receiver<TaskState>>,
    order: Mutex<VecDeque<TaskId>>,
    retained: usize,
}

impl Default for StateTable {
    fn default() -> Self {
        Self::with_retention(RETAINED_FINISHED)
    }
}

impl StateTable {
    pub(crate) fn with_retention(retained: usize) -> Self {
        Self {
            states: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            retained,
        }
    }

    pub(crate) fn track(&self, completion: &Completion) {
        self.states.insert(completion.id(), completion.subscribe());
        let mut order = self.order.lock().unwrap_or_else(PoisonError::into_inner);
        order.push_back(completion.id());

        let mut budget = order.len();
        while order.len() > self.retained && budget > 0 {
            budget -= 1;
            let Some(task_id) = order.pop_front() else { break };
            let finished = self.get(task_id).map_or(true, TaskState::is_terminal);
            if finished {
                self.states.remove(&task_id);
            } else {
                order.push_back(task_id);
            }
        }
    }

    pub(crate) fn get(&self, task_id: TaskId) -> Option<TaskState> {
        self.states.get(&task_id).map(|rx| *rx.borrow())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.states.len()
    }
}

/// A backend that runs tasks.
#[async_trait]
pub trait TaskScheduler: Send + Sync {
    fn name(&self) -> &str;

    /// Queue a task. Fails only when the scheduler has been stopped.
    async fn submit(&self, task: Task) -> Result<TaskHandle, SchedulerError>;

    fn state(&self, task_id: TaskId) -> Option<TaskState>;

    /// Withhold dispatch of queued tasks. Running tasks are unaffected.
    async fn pause(&self);

    async fn resume(&self);

    fn is_paused(&self) -> bool;

    /// Stop accepting work and wind down. Every outstanding task still
    /// receives a result.
    async fn stop(&self);
}
