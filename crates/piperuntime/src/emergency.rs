//! Emergency-stop registry.
//!
//! Every external job that outlives a poll cycle has a stop task registered
//! here. On abnormal shutdown, including a panic under `guard`, `stop_all`
//! kills them so nothing is left running on the cluster.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use pipecore::ExternalJobError;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Identity of a stop task: the external job id, scoped to the scheduler
/// instance that submitted it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StopKey {
    pub scope: Uuid,
    pub job_id: String,
}

impl StopKey {
    pub fn new(scope: Uuid, job_id: impl Into<String>) -> Self {
        Self {
            scope,
            job_id: job_id.into(),
        }
    }
}

#[async_trait]
pub trait StopTask: Send + Sync {
    fn key(&self) -> StopKey;

    async fn stop(&self) -> Result<(), ExternalJobError>;
}

/// Outcome of `stop_all`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopReport {
    pub attempted: usize,
    pub failed: usize,
}

/// Shared set of stop tasks. Cloning shares the same set.
#[derive(Clone, Default)]
pub struct EmergencyStopRegistry {
    tasks: Arc<DashMap<StopKey, Arc<dyn StopTask>>>,
}

impl EmergencyStopRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stop task. Returns false if one with the same key is
    /// already registered; the existing task is kept.
    pub fn add(&self, task: Arc<dyn StopTask>) -> bool {
        let key = task.key();
        match self.tasks.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(task);
                true
            }
        }
    }

    /// Returns false if nothing was registered under `key`.
    pub fn remove(&self, key: &StopKey) -> bool {
        self.tasks.remove(key).is_some()
    }

    pub fn contains(&self, key: &StopKey) -> bool {
        self.tasks.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run every registered stop task concurrently and empty the registry.
    /// A failing task does not prevent the others from running.
    pub async fn stop_all(&self) -> StopReport {
        let keys: Vec<StopKey> = self.tasks.iter().map(|entry| entry.key().clone()).collect();
        let tasks: Vec<Arc<dyn StopTask>> = keys
            .iter()
            .filter_map(|key| self.tasks.remove(key).map(|(_, task)| task))
            .collect();

        if tasks.is_empty() {
            return StopReport::default();
        }
        tracing::warn!("Emergency stop: stopping {} external job(s)", tasks.len());

        let outcomes = futures::future::join_all(tasks.iter().map(|task| async move {
            let key = task.key();
            let outcome = task.stop().await;
            (key, outcome)
        }))
        .await;

        let mut report = StopReport {
            attempted: outcomes.len(),
            failed: 0,
        };
        for (key, outcome) in outcomes {
            match outcome {
                Ok(()) => tracing::info!("Stopped job {}", key.job_id),
                Err(e) => {
                    report.failed += 1;
                    tracing::error!("Failed to stop job {}: {}", key.job_id, e);
                }
            }
        }
        report
    }
}

/// Stop everything and exit with status 130 on ctrl-c or SIGTERM.
pub fn install_signal_handler(registry: EmergencyStopRegistry) -> JoinHandle<()> {
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::error!("Interrupted; stopping {} registered job(s)", registry.len());
        let report = registry.stop_all().await;
        if report.failed > 0 {
            tracing::error!("{} of {} job(s) could not be stopped", report.failed, report.attempted);
        }
        std::process::exit(130);
    })
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Run `fut`; if it fails or panics, stop every registered job before
/// returning the error or resuming the panic.
pub async fn guard<F, T, E>(registry: &EmergencyStopRegistry, fut: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    let outcome = match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => {
            tracing::error!("Fatal panic; stopping {} registered job(s)", registry.len());
            report_stopped(registry.stop_all().await, "panic");
            std::panic::resume_unwind(panic);
        }
    };
    if outcome.is_err() {
        report_stopped(registry.stop_all().await, "failure");
    }
    outcome
}

fn report_stopped(report: StopReport, cause: &str) {
    if report.attempted > 0 {
        tracing::warn!(
            "Stopped {} job(s) after {} ({} failed)",
            report.attempted,
            cause,
            report.failed
        );
    }
}
