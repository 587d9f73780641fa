#![cfg(unix)]

use pipecore::{DependencyError, ProgressSink, Requirement};
use pipesteps::ContainerImageRequirement;
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Collects every progress report.
#[derive(Default)]
struct Recorder {
    reports: Mutex<Vec<(String, f64)>>,
}

impl ProgressSink for Recorder {
    fn report(&self, requirement: &str, fraction: f64, _message: &str) {
        self.reports.lock().unwrap().push((requirement.to_string(), fraction));
    }
}

/// A fake container runtime. Images "exist" once a marker file named after
/// them is present in `dir`; pulling `broken:*` fails and pulling
/// `phantom:*` claims success without storing anything.
fn fake_runtime(dir: &Path) -> PathBuf {
    let script = dir.join("fake-docker");
    let body = format!(
        r#"#!/bin/sh
store="{store}"
marker() {{ echo "$store/$(echo "$1" | tr '/:' '__')"; }}
case "$1" in
  image)
    [ -f "$(marker "$3")" ]
    ;;
  pull)
    case "$2" in
      broken:*) echo "Error response from daemon: manifest unknown" >&2; exit 1 ;;
      phantom:*) echo "Status: Downloaded newer image"; exit 0 ;;
    esac
    echo "latest: Pulling from $2"
    echo "aaa111: Pulling fs layer"
    echo "bbb222: Pulling fs layer"
    echo "aaa111: Pull complete"
    echo "bbb222: Already exists"
    touch "$(marker "$2")"
    ;;
  *) exit 2 ;;
esac
"#,
        store = dir.display()
    );
    std::fs::write(&script, body).unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    script
}

fn requirement(image: &str, runtime: &Path) -> ContainerImageRequirement {
    let mut requirement = ContainerImageRequirement::for_image(image);
    let params = HashMap::from([("runtime".to_string(), runtime.to_string_lossy().to_string())]);
    requirement.configure(&params).unwrap();
    requirement
}

#[tokio::test]
async fn test_pull_makes_image_available() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = fake_runtime(dir.path());
    let requirement = requirement("biocontainers/samtools:1.17", &runtime);
    assert!(!requirement.is_available().await);

    let recorder = Recorder::default();
    requirement.install(&recorder).await.unwrap();
    assert!(requirement.is_available().await);

    let reports = recorder.reports.lock().unwrap();
    assert!(reports.iter().all(|(name, _)| name == "container:biocontainers/samtools:1.17"));
    let fractions: Vec<f64> = reports.iter().map(|(_, f)| *f).collect();
    assert_eq!(fractions.first(), Some(&0.0));
    assert!(fractions.contains(&0.5));
    assert_eq!(fractions.last(), Some(&1.0));
    assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn test_failed_pull() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = fake_runtime(dir.path());
    let requirement = requirement("broken:1.0", &runtime);

    match requirement.install(&pipecore::NoProgress).await {
        Err(DependencyError::InstallFailed { name, reason }) => {
            assert_eq!(name, "container:broken:1.0");
            assert!(reason.contains("manifest unknown"), "{}", reason);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(!requirement.is_available().await);
}

#[tokio::test]
async fn test_missing_runtime_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let requirement = requirement("ubuntu", &dir.path().join("no-such-runtime"));
    assert!(!requirement.is_available().await);
    assert!(matches!(
        requirement.install(&pipecore::NoProgress).await,
        Err(DependencyError::InstallFailed { .. })
    ));
}

#[tokio::test]
async fn test_pull_without_image_fails() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = fake_runtime(dir.path());
    let requirement = requirement("phantom:2.1", &runtime);

    let recorder = Recorder::default();
    match requirement.install(&recorder).await {
        Err(DependencyError::InstallFailed { name, reason }) => {
            assert_eq!(name, "container:phantom:2.1");
            assert!(reason.contains("still not present"), "{}", reason);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(!requirement.is_available().await);
    assert!(!recorder.reports.lock().unwrap().iter().any(|(_, f)| *f == 1.0));
}
