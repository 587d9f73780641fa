use pipecore::{DependencyError, ProgressSink, Requirement};
use serde::Serialize;
use std::sync::Arc;

/// Availability of one requirement, as reported by `check_requirements`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequirementReport {
    pub name: String,
    pub available: bool,
    pub optional: bool,
    pub installable: bool,
}

/// Query every requirement without installing anything.
pub async fn check_requirements(requirements: &[Arc<dyn Requirement>]) -> Vec<RequirementReport> {
    let mut reports = Vec::with_capacity(requirements.len());
    for requirement in requirements {
        reports.push(RequirementReport {
            name: requirement.name().to_string(),
            available: requirement.is_available().await,
            optional: requirement.optional(),
            installable: requirement.installable(),
        });
    }
    reports
}

/// Make every requirement available.
///
/// Missing installable requirements are installed and checked again; an
/// install that reports success but leaves the requirement unavailable
/// counts as failed. Missing optional ones
/// are skipped with a warning, including optional ones whose installation
/// failed. Anything else fails with a `DependencyError`.
pub async fn ensure_requirements(
    requirements: &[Arc<dyn Requirement>],
    progress: &dyn ProgressSink,
) -> Result<(), DependencyError> {
    for requirement in requirements {
        let name = requirement.name();
        if requirement.is_available().await {
            tracing::debug!("Requirement {} is available", name);
            continue;
        }

        if requirement.installable() {
            tracing::info!("Installing requirement {}", name);
            let mut installed = requirement.install(progress).await;
            if installed.is_ok() && !requirement.is_available().await {
                installed = Err(DependencyError::InstallFailed {
                    name: name.to_string(),
                    reason: "still unavailable after install".to_string(),
                });
            }
            match installed {
                Ok(()) => continue,
                Err(e) if requirement.optional() => {
                    tracing::warn!("Skipping optional requirement {}: {}", name, e);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        if requirement.optional() {
            tracing::warn!("Optional requirement {} is not available; skipping", name);
            continue;
        }
        return Err(DependencyError::NotInstallable(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pipecore::{ConfigError, NoProgress};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Fake {
        name: &'static str,
        optional: bool,
        installable: bool,
        available: AtomicBool,
        install_works: bool,
        install_sticks: bool,
    }

    impl Fake {
        fn new(name: &'static str, available: bool) -> Self {
            Self {
                name,
                optional: false,
                installable: false,
                available: AtomicBool::new(available),
                install_works: true,
                install_sticks: true,
            }
        }
    }

    #[async_trait]
    impl Requirement for Fake {
        fn name(&self) -> &str {
            self.name
        }

        fn optional(&self) -> bool {
            self.optional
        }

        fn installable(&self) -> bool {
            self.installable
        }

        fn configure(&mut self, _params: &HashMap<String, String>) -> Result<(), ConfigError> {
            Ok(())
        }

        async fn is_available(&self) -> bool {
            self.available.load(Ordering::SeqCst)
        }

        async fn install(&self, progress: &dyn ProgressSink) -> Result<(), DependencyError> {
            progress.report(self.name, 1.0, "done");
            if self.install_works {
                self.available.store(self.install_sticks, Ordering::SeqCst);
                Ok(())
            } else {
                Err(DependencyError::InstallFailed {
                    name: self.name.to_string(),
                    reason: "mirror unreachable".to_string(),
                })
            }
        }
    }

    #[tokio::test]
    async fn test_installs_missing_installable() {
        let mut fake = Fake::new("samtools", false);
        fake.installable = true;
        let fake = Arc::new(fake);
        let requirements: Vec<Arc<dyn Requirement>> = vec![fake.clone()];

        ensure_requirements(&requirements, &NoProgress).await.unwrap();
        assert!(fake.is_available().await);
    }

    #[tokio::test]
    async fn test_missing_optional_is_skipped() {
        let mut optional = Fake::new("igv", false);
        optional.optional = true;
        let mut broken = Fake::new("picard", false);
        broken.optional = true;
        broken.installable = true;
        broken.install_works = false;

        let requirements: Vec<Arc<dyn Requirement>> = vec![Arc::new(optional), Arc::new(broken)];
        assert!(ensure_requirements(&requirements, &NoProgress).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_mandatory_fails() {
        let requirements: Vec<Arc<dyn Requirement>> =
            vec![Arc::new(Fake::new("bwa", true)), Arc::new(Fake::new("gatk", false))];

        let err = ensure_requirements(&requirements, &NoProgress).await.unwrap_err();
        assert_eq!(err, DependencyError::NotInstallable("gatk".to_string()));

        let reports = check_requirements(&requirements).await;
        assert!(reports[0].available);
        assert!(!reports[1].available);
    }

    #[tokio::test]
    async fn test_install_leaving_requirement_missing_fails() {
        let mut fake = Fake::new("bcftools", false);
        fake.installable = true;
        fake.install_sticks = false;
        let requirements: Vec<Arc<dyn Requirement>> = vec![Arc::new(fake)];

        match ensure_requirements(&requirements, &NoProgress).await {
            Err(DependencyError::InstallFailed { name, reason }) => {
                assert_eq!(name, "bcftools");
                assert!(reason.contains("still unavailable"), "{}", reason);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        let mut optional = Fake::new("multiqc", false);
        optional.optional = true;
        optional.installable = true;
        optional.install_sticks = false;
        let requirements: Vec<Arc<dyn Requirement>> = vec![Arc::new(optional)];
        assert!(ensure_requirements(&requirements, &NoProgress).await.is_ok());
    }
}
