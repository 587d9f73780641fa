#![cfg(unix)]

mod common;

use common::{empty_context, FnStep};
use pipecore::{ErrorKind, EventBus, Ports, Resources, Step, TaskContext};
use piperuntime::{
    BatchSystem, ClusterConfig, ClusterScheduler, EmergencyStopRegistry, Task, TaskScheduler, TaskState,
};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Stub wrapper: `submit` records its arguments and prints job ids counting
/// up from 4242, `status` prints the contents of `state` (or fails when
/// `status_fails` exists), `kill` appends the job id to `killed`. The
/// `submit_delay` and `status_delay` files slow the matching command down.
const WRAPPER: &str = r#"#!/bin/sh
dir="$(dirname "$0")"
case "$1" in
  submit)
    shift
    if [ -e "$dir/submit_delay" ]; then sleep "$(cat "$dir/submit_delay")"; fi
    echo "$@" > "$dir/submit_args"
    job=$(( $(cat "$dir/last_job" 2>/dev/null || echo 4241) + 1 ))
    echo "$job" > "$dir/last_job"
    echo "Submitted batch job"
    echo ""
    echo "$job"
    ;;
  status)
    if [ -e "$dir/status_delay" ]; then sleep "$(cat "$dir/status_delay")"; fi
    if [ -e "$dir/status_fails" ]; then
      echo "scheduler unreachable" >&2
      exit 1
    fi
    cat "$dir/state"
    ;;
  kill)
    echo "$2" >> "$dir/killed"
    ;;
esac
"#;

struct Cluster {
    dir: TempDir,
    registry: EmergencyStopRegistry,
    scheduler: ClusterScheduler,
}

fn cluster(state: &str, terminal_grace: Duration) -> Cluster {
    let dir = tempfile::tempdir().unwrap();
    let wrapper = dir.path().join(BatchSystem::Slurm.wrapper_name());
    std::fs::write(&wrapper, WRAPPER).unwrap();
    std::fs::set_permissions(&wrapper, std::fs::Permissions::from_mode(0o755)).unwrap();
    set_state(dir.path(), state);

    let config = ClusterConfig {
        batch_system: BatchSystem::Slurm,
        wrapper_dir: dir.path().to_path_buf(),
        poll_interval: Duration::from_millis(30),
        command_timeout: Duration::from_secs(5),
        max_poll_failures: 3,
        terminal_grace,
    };
    let registry = EmergencyStopRegistry::new();
    let scheduler = ClusterScheduler::new(config, EventBus::default(), registry.clone()).unwrap();
    Cluster {
        dir,
        registry,
        scheduler,
    }
}

fn set_state(dir: &Path, state: &str) {
    std::fs::write(dir.join("state"), format!("{}\n", state)).unwrap();
}

fn shell_step() -> Arc<dyn Step> {
    Arc::new(FnStep::new(|_ctx| async { Ok(()) }).with_command(&["bash", "-c", "true"]))
}

fn context_in(dir: &Path, step_id: &str, resources: Resources) -> TaskContext {
    let ports = Ports::new();
    TaskContext::builder(step_id, "test.fn", &ports, &ports)
        .work_dir(dir.join("work"))
        .resources(resources)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_completed_job_succeeds() {
    let cluster = cluster("COMPLETED", Duration::from_secs(60));
    let resources = Resources {
        cpus: 4,
        memory_mb: 8192,
        walltime_secs: Some(3600),
    };
    let context = context_in(cluster.dir.path(), "align", resources);
    let task_file = context
        .work_dir()
        .join(format!("task-{}", context.id()))
        .join("task.json");

    let handle = cluster
        .scheduler
        .submit(Task::new(shell_step(), context))
        .await
        .unwrap();
    assert_eq!(cluster.registry.len(), 1);

    let result = handle.wait().await;
    assert!(result.success, "{:?}", result.error);
    assert!(cluster.registry.is_empty());

    let descriptor: serde_json::Value =
        serde_json::from_slice(&std::fs::read(task_file).unwrap()).unwrap();
    assert_eq!(descriptor["step_id"], "align");

    let args = std::fs::read_to_string(cluster.dir.path().join("submit_args")).unwrap();
    assert!(args.contains("--cpus 4"));
    assert!(args.contains("--memory-mb 8192"));
    assert!(args.contains("--walltime-secs 3600"));
    assert!(args.trim_end().ends_with("-- bash -c true"));
}

#[tokio::test]
async fn test_failed_job_fails_task() {
    let cluster = cluster("CANCELLED by 0", Duration::from_secs(60));
    let context = context_in(cluster.dir.path(), "call", Resources::default());
    let result = cluster
        .scheduler
        .submit(Task::new(shell_step(), context))
        .await
        .unwrap()
        .wait()
        .await;

    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::ExternalJob));
    assert!(result.error.unwrap().contains("4242"));
    assert!(cluster.registry.is_empty());
}

#[tokio::test]
async fn test_unknown_status_runs_until_lifetime_expires() {
    let cluster = cluster("MYSTERY", Duration::from_millis(400));
    let resources = Resources {
        walltime_secs: Some(0),
        ..Resources::default()
    };
    let context = context_in(cluster.dir.path(), "sort", resources);
    let handle = cluster
        .scheduler
        .submit(Task::new(shell_step(), context))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(cluster.scheduler.state(handle.id()), Some(TaskState::Running));

    let result = handle.wait().await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("MYSTERY"));
}

#[tokio::test]
async fn test_step_without_command_line_fails() {
    let cluster = cluster("COMPLETED", Duration::from_secs(60));
    let step = Arc::new(FnStep::new(|_ctx| async { Ok(()) }));
    let context = context_in(cluster.dir.path(), "local-only", Resources::default());

    let result = cluster
        .scheduler
        .submit(Task::new(step, context))
        .await
        .unwrap()
        .wait()
        .await;
    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::Configuration));
    assert!(cluster.registry.is_empty());
}

#[tokio::test]
async fn test_repeated_poll_failures_fail_task() {
    let cluster = cluster("RUNNING", Duration::from_secs(60));
    std::fs::write(cluster.dir.path().join("status_fails"), "").unwrap();

    let context = context_in(cluster.dir.path(), "index", Resources::default());
    let result = cluster
        .scheduler
        .submit(Task::new(shell_step(), context))
        .await
        .unwrap()
        .wait()
        .await;
    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::ExternalJob));
    assert!(result.error.unwrap().contains("scheduler unreachable"));
}

#[tokio::test]
async fn test_pause_holds_submission_and_stop_kills_jobs() {
    let cluster = cluster("RUNNING", Duration::from_secs(60));
    cluster.scheduler.pause().await;

    let handle = cluster
        .scheduler
        .submit(Task::new(shell_step(), context_in(cluster.dir.path(), "a", Resources::default())))
        .await
        .unwrap();
    assert!(cluster.registry.is_empty());
    assert!(!cluster.dir.path().join("submit_args").exists());
    assert_eq!(handle.state(), TaskState::Submitted);

    cluster.scheduler.resume().await;
    assert_eq!(cluster.registry.len(), 1);
    assert_eq!(cluster.scheduler.outstanding().await, 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.state(), TaskState::Running);

    cluster.scheduler.stop().await;
    let killed = std::fs::read_to_string(cluster.dir.path().join("killed")).unwrap();
    assert_eq!(killed.trim(), "4242");
    assert!(cluster.registry.is_empty());

    let result = handle.wait().await;
    assert_eq!(result.error_kind, Some(ErrorKind::Cancelled));

    let err = cluster
        .scheduler
        .submit(Task::new(shell_step(), empty_context("late")))
        .await;
    assert!(err.is_err());
}

#[tokio::test]
async fn test_stop_during_submission_kills_job() {
    let cluster = cluster("RUNNING", Duration::from_secs(60));
    std::fs::write(cluster.dir.path().join("submit_delay"), "1").unwrap();

    let context = context_in(cluster.dir.path(), "slow-submit", Resources::default());
    let (submitted, ()) = tokio::join!(cluster.scheduler.submit(Task::new(shell_step(), context)), async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        cluster.scheduler.stop().await;
    });

    let result = tokio::time::timeout(Duration::from_secs(3), submitted.unwrap().wait())
        .await
        .expect("task never finished after stop");
    assert_eq!(result.error_kind, Some(ErrorKind::Cancelled));

    let killed = std::fs::read_to_string(cluster.dir.path().join("killed")).unwrap();
    assert_eq!(killed.trim(), "4242");
    assert!(cluster.registry.is_empty());
    assert_eq!(cluster.scheduler.outstanding().await, 0);
}

#[tokio::test]
async fn test_slow_status_does_not_block_submission() {
    let cluster = cluster("RUNNING", Duration::from_secs(60));
    std::fs::write(cluster.dir.path().join("status_delay"), "1").unwrap();

    let mut handles = Vec::new();
    for step_id in ["a", "b", "c"] {
        let context = context_in(cluster.dir.path(), step_id, Resources::default());
        handles.push(cluster.scheduler.submit(Task::new(shell_step(), context)).await.unwrap());
    }
    // Let a poll round start on the three jobs.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    let context = context_in(cluster.dir.path(), "d", Resources::default());
    handles.push(cluster.scheduler.submit(Task::new(shell_step(), context)).await.unwrap());
    assert!(started.elapsed() < Duration::from_millis(900), "{:?}", started.elapsed());
    assert_eq!(cluster.scheduler.outstanding().await, 4);
    assert_eq!(cluster.registry.len(), 4);

    set_state(cluster.dir.path(), "COMPLETED");
    let started = Instant::now();
    for handle in handles {
        let result = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("job never completed");
        assert!(result.success, "{:?}", result.error);
    }
    // One concurrent round per poll, not one status call after another.
    assert!(started.elapsed() < Duration::from_millis(3500), "{:?}", started.elapsed());
    assert!(cluster.registry.is_empty());
}

#[tokio::test]
async fn test_resume_racing_submissions_dispatches_all() {
    let cluster = cluster("COMPLETED", Duration::from_secs(60));
    cluster.scheduler.pause().await;

    let submissions = futures::future::join_all((0..8).map(|i| {
        let context = context_in(cluster.dir.path(), &format!("s{}", i), Resources::default());
        cluster.scheduler.submit(Task::new(shell_step(), context))
    }));
    let (handles, ()) = tokio::join!(submissions, cluster.scheduler.resume());

    for handle in handles {
        let result = tokio::time::timeout(Duration::from_secs(5), handle.unwrap().wait())
            .await
            .expect("task left behind in the held queue");
        assert!(result.success, "{:?}", result.error);
    }
    assert!(!cluster.scheduler.is_paused());
}
