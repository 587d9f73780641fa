use crate::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

pub type RunId = Uuid;

/// Events emitted while a pipeline runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    RunStarted {
        run_id: RunId,
        pipeline: String,
        timestamp: DateTime<Utc>,
    },
    RunCompleted {
        run_id: RunId,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    TaskSubmitted {
        task_id: TaskId,
        step_id: String,
        scheduler: String,
        timestamp: DateTime<Utc>,
    },
    TaskStarted {
        task_id: TaskId,
        step_id: String,
        timestamp: DateTime<Utc>,
    },
    TaskCompleted {
        task_id: TaskId,
        step_id: String,
        success: bool,
        duration_ms: u64,
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
    TaskEvent {
        task_id: TaskId,
        step_id: String,
        event: TaskEvent,
        timestamp: DateTime<Utc>,
    },
    JobSubmitted {
        task_id: TaskId,
        job_id: String,
        batch_system: String,
        timestamp: DateTime<Utc>,
    },
    JobStateChanged {
        task_id: TaskId,
        job_id: String,
        state: String,
        timestamp: DateTime<Utc>,
    },
    SchedulerPaused {
        scheduler: String,
        timestamp: DateTime<Utc>,
    },
    SchedulerResumed {
        scheduler: String,
        timestamp: DateTime<Utc>,
    },
    SchedulerStopped {
        scheduler: String,
        abandoned: usize,
        timestamp: DateTime<Utc>,
    },
}

/// Updates a running task reports about itself
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum TaskEvent {
    Info { message: String },
    Warning { message: String },
    Progress { fraction: f64 },
    Counter { name: String, value: u64 },
}

/// Sends events on behalf of a single task
#[derive(Clone, Debug)]
pub struct EventEmitter {
    task_id: TaskId,
    step_id: String,
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventEmitter {
    pub fn new(
        task_id: TaskId,
        step_id: impl Into<String>,
        sender: broadcast::Sender<ExecutionEvent>,
    ) -> Self {
        Self {
            task_id,
            step_id: step_id.into(),
            sender,
        }
    }

    pub fn emit(&self, event: TaskEvent) {
        let _ = self.sender.send(ExecutionEvent::TaskEvent {
            task_id: self.task_id,
            step_id: self.step_id.clone(),
            event,
            timestamp: Utc::now(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(TaskEvent::Info {
            message: message.into(),
        });
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(TaskEvent::Warning {
            message: message.into(),
        });
    }

    pub fn progress(&self, fraction: f64) {
        self.emit(TaskEvent::Progress { fraction });
    }

    pub fn counter(&self, name: impl Into<String>, value: u64) {
        self.emit(TaskEvent::Counter {
            name: name.into(),
            value,
        });
    }
}

/// Broadcast bus shared by schedulers and the runner. Sending never blocks
/// and events without subscribers are dropped.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn create_emitter(&self, task_id: TaskId, step_id: impl Into<String>) -> EventEmitter {
        EventEmitter::new(task_id, step_id, self.sender.clone())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}
