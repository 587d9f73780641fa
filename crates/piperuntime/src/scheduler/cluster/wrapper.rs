use super::BatchSystem;
use pipecore::ExternalJobError;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Parameters of one job submission.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub name: String,
    pub cpus: u32,
    pub memory_mb: u64,
    pub walltime_secs: Option<u64>,
    pub work_dir: PathBuf,
    pub command: Vec<String>,
}

/// Calls the wrapper script of a batch system:
///
/// ```text
/// <wrapper> submit --name N --cpus C --memory-mb M --walltime-secs W --workdir D -- <cmd...>
/// <wrapper> status <job-id>
/// <wrapper> kill <job-id>
/// ```
///
/// `submit` prints the job id as its last non-empty line; `status` prints a
/// state string. Each call has its own timeout.
#[derive(Debug, Clone)]
pub struct Wrapper {
    program: PathBuf,
    timeout: Duration,
}

impl Wrapper {
    pub fn new(dir: &Path, system: BatchSystem, timeout: Duration) -> Self {
        Self {
            program: dir.join(system.wrapper_name()),
            timeout,
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub async fn submit(&self, request: &SubmitRequest) -> Result<String, ExternalJobError> {
        let mut args = vec![
            "submit".to_string(),
            "--name".to_string(),
            request.name.clone(),
            "--cpus".to_string(),
            request.cpus.to_string(),
            "--memory-mb".to_string(),
            request.memory_mb.to_string(),
            "--walltime-secs".to_string(),
            request.walltime_secs.unwrap_or(0).to_string(),
            "--workdir".to_string(),
            request.work_dir.display().to_string(),
            "--".to_string(),
        ];
        args.extend(request.command.iter().cloned());

        let stdout = self.invoke(&args).await?;
        stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .map(str::to_string)
            .ok_or(ExternalJobError::EmptyJobId)
    }

    pub async fn status(&self, job_id: &str) -> Result<String, ExternalJobError> {
        let stdout = self.invoke(&["status".to_string(), job_id.to_string()]).await?;
        let state = stdout.trim();
        if state.is_empty() {
            return Err(ExternalJobError::EmptyStatus(job_id.to_string()));
        }
        Ok(state.to_string())
    }

    pub async fn kill(&self, job_id: &str) -> Result<(), ExternalJobError> {
        self.invoke(&["kill".to_string(), job_id.to_string()]).await?;
        Ok(())
    }

    async fn invoke(&self, args: &[String]) -> Result<String, ExternalJobError> {
        let command = format!(
            "{} {}",
            self.program.display(),
            args.first().map(String::as_str).unwrap_or_default()
        );

        let child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ExternalJobError::Spawn {
                    command,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(ExternalJobError::Timeout {
                    command,
                    seconds: self.timeout.as_secs(),
                })
            }
        };

        if !output.status.success() {
            return Err(ExternalJobError::CommandFailed {
                command,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
