use super::{Completion, SchedulerError, StateTable, Task, TaskHandle, TaskScheduler, TaskState};
use async_trait::async_trait;
use chrono::Utc;
use pipecore::{ConfigError, EventBus, ExecutionEvent, TaskError, TaskId, TaskResult, TaskStatus};
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;

const NAME: &str = "local";

struct Queued {
    task: Task,
    completion: Completion,
}

struct Shared {
    queue: Mutex<mpsc::UnboundedReceiver<Queued>>,
    paused: watch::Sender<bool>,
    shutdown: CancellationToken,
    events: EventBus,
    states: StateTable,
}

/// In-process scheduler backed by a fixed pool of workers pulling from a
/// FIFO queue.
///
/// Pausing holds back dispatch: a worker that dequeues a task while paused
/// waits for `resume` before starting it. Tasks already running are not
/// affected.
pub struct LocalScheduler {
    shared: Arc<Shared>,
    sender: std::sync::Mutex<Option<mpsc::UnboundedSender<Queued>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    threads: usize,
    stop_timeout: Duration,
    stopped: AtomicBool,
}

impl LocalScheduler {
    pub fn new(threads: usize, stop_timeout: Duration, events: EventBus) -> Result<Self, ConfigError> {
        if threads == 0 {
            return Err(ConfigError::InvalidThreadCount);
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let (paused, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            queue: Mutex::new(receiver),
            paused,
            shutdown: CancellationToken::new(),
            events,
            states: StateTable::default(),
        });

        let workers = (0..threads)
            .map(|worker| tokio::spawn(worker_loop(worker, shared.clone())))
            .collect();

        tracing::info!("Local scheduler started with {} worker(s)", threads);
        Ok(Self {
            shared,
            sender: std::sync::Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            threads,
            stop_timeout,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Fail everything still sitting in the queue.
    async fn drain_queue(&self) -> usize {
        let mut queue = self.shared.queue.lock().await;
        let mut drained = 0;
        while let Ok(queued) = queue.try_recv() {
            let result = TaskResult::failed(queued.task.id(), queued.task.step_id(), &TaskError::Cancelled);
            queued.completion.finish(result);
            drained += 1;
        }
        drained
    }
}

#[async_trait]
impl TaskScheduler for LocalScheduler {
    fn name(&self) -> &str {
        NAME
    }

    async fn submit(&self, task: Task) -> Result<TaskHandle, SchedulerError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SchedulerError::Stopped);
        }
        let (completion, handle) = Completion::new(task.id(), task.step_id());
        self.shared.states.track(&completion);

        let task_id = task.id();
        let step_id = task.step_id().to_string();
        {
            // Sent under the lock `stop` takes the sender with, so a queued
            // task is always there for the final drain.
            let sender = self.sender.lock().map_err(|_| SchedulerError::Stopped)?;
            sender
                .as_ref()
                .ok_or(SchedulerError::Stopped)?
                .send(Queued { task, completion })
                .map_err(|_| SchedulerError::Stopped)?;
        }

        tracing::debug!("Queued task {} for step {}", task_id, step_id);
        self.shared.events.emit(ExecutionEvent::TaskSubmitted {
            task_id,
            step_id,
            scheduler: NAME.to_string(),
            timestamp: Utc::now(),
        });
        Ok(handle)
    }

    fn state(&self, task_id: TaskId) -> Option<TaskState> {
        self.shared.states.get(task_id)
    }

    async fn pause(&self) {
        if !self.shared.paused.send_replace(true) {
            tracing::info!("Local scheduler paused");
            self.shared.events.emit(ExecutionEvent::SchedulerPaused {
                scheduler: NAME.to_string(),
                timestamp: Utc::now(),
            });
        }
    }

    async fn resume(&self) {
        if self.shared.paused.send_replace(false) {
            tracing::info!("Local scheduler resumed");
            self.shared.events.emit(ExecutionEvent::SchedulerResumed {
                scheduler: NAME.to_string(),
                timestamp: Utc::now(),
            });
        }
    }

    fn is_paused(&self) -> bool {
        *self.shared.paused.borrow()
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Stopping local scheduler");

        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        self.shared.shutdown.cancel();

        let mut workers = std::mem::take(&mut *self.workers.lock().await);
        let joined = tokio::time::timeout(
            self.stop_timeout,
            futures::future::join_all(workers.iter_mut()),
        )
        .await;

        if joined.is_err() {
            tracing::error!(
                "Forceful shutdown: workers did not finish within {:?}; abandoning running tasks",
                self.stop_timeout
            );
            for worker in &workers {
                worker.abort();
            }
        }

        let abandoned = self.drain_queue().await;
        self.shared.events.emit(ExecutionEvent::SchedulerStopped {
            scheduler: NAME.to_string(),
            abandoned,
            timestamp: Utc::now(),
        });
        tracing::info!("Local scheduler stopped ({} queued task(s) cancelled)", abandoned);
    }
}

impl Drop for LocalScheduler {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

async fn worker_loop(worker: usize, shared: Arc<Shared>) {
    loop {
        let next = {
            let mut queue = shared.queue.lock().await;
            tokio::select! {
                biased;
                _ = shared.shutdown.cancelled() => None,
                queued = queue.recv() => queued,
            }
        };
        let Some(queued) = next else {
            break;
        };

        if !wait_while_paused(&shared).await {
            let result = TaskResult::failed(queued.task.id(), queued.task.step_id(), &TaskError::Cancelled);
            queued.completion.finish(result);
            break;
        }

        run_task(worker, &shared, queued).await;
    }
    tracing::debug!("Worker {} exiting", worker);
}

/// Returns false when shutdown arrives while paused.
async fn wait_while_paused(shared: &Shared) -> bool {
    let mut paused = shared.paused.subscribe();
    loop {
        if !*paused.borrow_and_update() {
            return true;
        }
        tokio::select! {
            _ = shared.shutdown.cancelled() => return false,
            changed = paused.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn run_task(worker: usize, shared: &Shared, queued: Queued) {
    let Queued { task, completion } = queued;
    let task_id = task.id();
    let step_id = task.step_id().to_string();

    completion.set_state(TaskState::Running);
    shared.events.emit(ExecutionEvent::TaskStarted {
        task_id,
        step_id: step_id.clone(),
        timestamp: Utc::now(),
    });
    tracing::debug!("Worker {} running task {} ({})", worker, task_id, step_id);

    let status = TaskStatus::new(task_id, step_id.clone())
        .with_events(shared.events.create_emitter(task_id, step_id.clone()));
    let step = task.step.clone();
    let context = task.context.clone();
    let mut body = tokio::spawn(async move {
        let mut status = status;
        let outcome = step.execute(&context, &mut status).await;
        (status, outcome)
    });
    let _guard = AbortOnDrop(body.abort_handle());

    let joined = tokio::select! {
        joined = &mut body => joined,
        _ = shared.shutdown.cancelled() => {
            // let cooperative steps wind down, then keep waiting
            task.context.cancellation().cancel();
            (&mut body).await
        }
    };

    let result = match joined {
        Ok((status, Ok(()))) => TaskResult::from_status(status, None),
        Ok((status, Err(e))) => TaskResult::from_status(status, Some(&e)),
        Err(e) if e.is_panic() => {
            let error = TaskError::Panicked(panic_message(e.into_panic()));
            TaskResult::failed(task_id, step_id.clone(), &error)
        }
        Err(_) => TaskResult::failed(task_id, step_id.clone(), &TaskError::Cancelled),
    };

    if let Some(error) = &result.error {
        tracing::warn!("Task {} ({}) failed: {}", task_id, step_id, error);
    } else {
        tracing::info!("Task {} ({}) completed in {}ms", task_id, step_id, result.duration_ms);
    }
    shared.events.emit(ExecutionEvent::TaskCompleted {
        task_id,
        step_id,
        success: result.success,
        duration_ms: result.duration_ms,
        error: result.error.clone(),
        timestamp: Utc::now(),
    });
    completion.finish(result);
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
