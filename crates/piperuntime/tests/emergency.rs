use async_trait::async_trait;
use pipecore::ExternalJobError;
use piperuntime::emergency::guard;
use piperuntime::{EmergencyStopRegistry, StopKey, StopTask};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

struct CountingStop {
    key: StopKey,
    calls: Arc<AtomicUsize>,
    fails: bool,
}

impl CountingStop {
    fn new(scope: Uuid, job_id: &str, calls: Arc<AtomicUsize>) -> Arc<Self> {
        Arc::new(Self {
            key: StopKey::new(scope, job_id),
            calls,
            fails: false,
        })
    }

    fn failing(scope: Uuid, job_id: &str, calls: Arc<AtomicUsize>) -> Arc<Self> {
        Arc::new(Self {
            key: StopKey::new(scope, job_id),
            calls,
            fails: true,
        })
    }
}

#[async_trait]
impl StopTask for CountingStop {
    fn key(&self) -> StopKey {
        self.key.clone()
    }

    async fn stop(&self) -> Result<(), ExternalJobError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fails {
            return Err(ExternalJobError::CommandFailed {
                command: "slurm_wrapper kill".to_string(),
                code: Some(1),
                stderr: "invalid job id".to_string(),
            });
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_same_job_id_deduplicates() {
    let registry = EmergencyStopRegistry::new();
    let scope = Uuid::new_v4();
    let calls = Arc::new(AtomicUsize::new(0));

    assert!(registry.add(CountingStop::new(scope, "17", calls.clone())));
    assert!(!registry.add(CountingStop::new(scope, "17", calls.clone())));
    assert_eq!(registry.len(), 1);

    let report = registry.stop_all().await;
    assert_eq!(report.attempted, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_same_job_id_in_other_scope_is_distinct() {
    let registry = EmergencyStopRegistry::new();
    let calls = Arc::new(AtomicUsize::new(0));

    assert!(registry.add(CountingStop::new(Uuid::new_v4(), "17", calls.clone())));
    assert!(registry.add(CountingStop::new(Uuid::new_v4(), "17", calls.clone())));
    assert_eq!(registry.len(), 2);
}

#[tokio::test]
async fn test_failing_stop_does_not_block_others() {
    let registry = EmergencyStopRegistry::new();
    let scope = Uuid::new_v4();
    let calls = Arc::new(AtomicUsize::new(0));

    registry.add(CountingStop::failing(scope, "1", calls.clone()));
    registry.add(CountingStop::new(scope, "2", calls.clone()));
    registry.add(CountingStop::new(scope, "3", calls.clone()));

    let report = registry.stop_all().await;
    assert_eq!(report.attempted, 3);
    assert_eq!(report.failed, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_remove_leaves_nothing_to_stop() {
    let registry = EmergencyStopRegistry::new();
    let scope = Uuid::new_v4();
    let calls = Arc::new(AtomicUsize::new(0));

    registry.add(CountingStop::new(scope, "9", calls.clone()));
    let key = StopKey::new(scope, "9");
    assert!(registry.contains(&key));
    assert!(registry.remove(&key));
    assert!(!registry.remove(&key));
    assert_eq!(registry.len(), 0);

    let report = registry.stop_all().await;
    assert_eq!(report.attempted, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_guard_stops_jobs_on_error() {
    let registry = EmergencyStopRegistry::new();
    let scope = Uuid::new_v4();
    let calls = Arc::new(AtomicUsize::new(0));
    registry.add(CountingStop::new(scope, "5", calls.clone()));

    let ok: Result<u32, String> = guard(&registry, async { Ok(1) }).await;
    assert_eq!(ok, Ok(1));
    assert_eq!(registry.len(), 1);

    let err: Result<u32, String> = guard(&registry, async { Err("boom".to_string()) }).await;
    assert!(err.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_guard_stops_jobs_on_panic() {
    let registry = EmergencyStopRegistry::new();
    let calls = Arc::new(AtomicUsize::new(0));
    registry.add(CountingStop::new(Uuid::new_v4(), "8", calls.clone()));

    let guarded = registry.clone();
    let outcome = tokio::spawn(async move {
        guard(&guarded, async {
            if !guarded.is_empty() {
                panic!("run state corrupted");
            }
            Ok::<u32, String>(0)
        })
        .await
    })
    .await;

    let err = outcome.unwrap_err();
    assert!(err.is_panic());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(registry.is_empty());
}
