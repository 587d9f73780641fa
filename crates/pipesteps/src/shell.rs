use crate::formats::FormatTable;
use crate::requirements::{ContainerImageRequirement, ExecutableRequirement};
use async_trait::async_trait;
use pipecore::{
    Cardinality, ConfigError, Data, FormatRegistry, Port, Ports, Requirement, Step, TaskContext, TaskError,
    TaskStatus,
};
use piperuntime::{StepFactory, StepMetadata};
use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

const STEP_TYPE: &str = "shell.run";

/// Runs a shell script with its ports exported as environment variables.
///
/// Parameters:
/// - `script`: the script (required)
/// - `inputs`, `outputs`: comma-separated `name:format` port declarations;
///   a trailing `?` on an input makes it optional
/// - `shell`: interpreter (default `bash`)
/// - `requires`: comma-separated programs that must be on `PATH`
/// - `container`: container image that must be present (pulled if missing)
///
/// Each port `name` is exported as `IN_NAME` / `OUT_NAME`, holding the
/// space-separated paths (or references) of its files. `WORK_DIR` points at
/// the task's working directory.
pub struct ShellStep {
    formats: FormatTable,
    inputs: Ports,
    outputs: Ports,
    script: String,
    shell: String,
    requires: Vec<String>,
    container: Option<String>,
}

impl ShellStep {
    pub fn new(formats: &FormatRegistry) -> Self {
        Self {
            formats: FormatTable::from_registry(formats),
            inputs: Ports::new(),
            outputs: Ports::new(),
            script: String::new(),
            shell: "bash".to_string(),
            requires: Vec::new(),
            container: None,
        }
    }

    fn parse_ports(&self, param: &str, value: &str, allow_optional: bool) -> Result<Ports, ConfigError> {
        let mut ports = Ports::new();
        for declaration in value.split(',').map(str::trim).filter(|d| !d.is_empty()) {
            let (name, format) = declaration.split_once(':').ok_or_else(|| {
                ConfigError::invalid_parameter(param, format!("'{}' is not name:format", declaration))
            })?;
            let (format, optional) = match format.strip_suffix('?') {
                Some(format) if allow_optional => (format, true),
                Some(_) => {
                    return Err(ConfigError::invalid_parameter(param, "outputs cannot be optional"))
                }
                None => (format, false),
            };
            let mut port = Port::new(name.trim(), self.formats.require(format.trim())?);
            if optional {
                port = port.with_cardinality(Cardinality::Optional);
            }
            ports.add(port)?;
        }
        Ok(ports)
    }

    /// Environment handed to the script.
    fn environment(&self, ctx: &TaskContext) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        let bound = |data: &Data| {
            data.files()
                .iter()
                .map(|file| {
                    file.local_path()
                        .map(|path| path.display().to_string())
                        .unwrap_or_else(|| file.reference().to_string())
                })
                .collect::<Vec<_>>()
                .join(" ")
        };
        for (port, data) in ctx.inputs() {
            env.insert(format!("IN_{}", env_name(port)), bound(data));
        }
        for (port, data) in ctx.outputs() {
            env.insert(format!("OUT_{}", env_name(port)), bound(data));
        }
        env.insert("WORK_DIR".to_string(), ctx.work_dir().display().to_string());
        env
    }

    /// Argument vector running the script with the port variables exported
    /// at its top. Local runs and cluster submissions both use it.
    fn invocation(&self, ctx: &TaskContext) -> Vec<String> {
        let mut script = String::new();
        for (name, value) in self.environment(ctx) {
            script.push_str(&format!("export {}={}\n", name, shell_quote(&value)));
        }
        script.push_str(&self.script);
        vec![
            "/usr/bin/env".to_string(),
            self.shell.clone(),
            "-euo".to_string(),
            "pipefail".to_string(),
            "-c".to_string(),
            script,
        ]
    }
}

fn env_name(port: &str) -> String {
    port.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

/// Quote `value` for a POSIX shell.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[async_trait]
impl Step for ShellStep {
    fn step_type(&self) -> &str {
        STEP_TYPE
    }

    fn description(&self) -> &str {
        "Run a shell script"
    }

    fn input_ports(&self) -> &Ports {
        &self.inputs
    }

    fn output_ports(&self) -> &Ports {
        &self.outputs
    }

    fn configure(&mut self, params: &HashMap<String, String>) -> Result<(), ConfigError> {
        for (name, value) in params {
            match name.as_str() {
                "script" => self.script = value.clone(),
                "shell" => self.shell = value.clone(),
                "inputs" => self.inputs = self.parse_ports(name, value, true)?,
                "outputs" => self.outputs = self.parse_ports(name, value, false)?,
                "requires" => {
                    self.requires = value
                        .split(',')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(String::from)
                        .collect()
                }
                "container" => self.container = Some(value.clone()),
                _ => return Err(ConfigError::UnknownParameter(name.clone())),
            }
        }
        if self.script.trim().is_empty() {
            return Err(ConfigError::invalid_parameter("script", "a script is required"));
        }
        Ok(())
    }

    fn requirements(&self) -> Vec<Arc<dyn Requirement>> {
        let mut requirements: Vec<Arc<dyn Requirement>> =
            vec![Arc::new(ExecutableRequirement::for_program(&self.shell))];
        for program in &self.requires {
            requirements.push(Arc::new(ExecutableRequirement::for_program(program)));
        }
        if let Some(image) = &self.container {
            requirements.push(Arc::new(ContainerImageRequirement::for_image(image)));
        }
        requirements
    }

    fn command_line(&self, ctx: &TaskContext) -> Option<Vec<String>> {
        Some(self.invocation(ctx))
    }

    async fn execute(&self, ctx: &TaskContext, status: &mut TaskStatus) -> Result<(), TaskError> {
        tokio::fs::create_dir_all(ctx.work_dir()).await?;

        let invocation = self.invocation(ctx);
        let (program, args) = invocation
            .split_first()
            .ok_or_else(|| TaskError::Failed("empty shell invocation".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(ctx.work_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| TaskError::Failed(format!("cannot start {}: {}", self.shell, e)))?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let step_id = ctx.step_id().to_string();
        let stdout_lines = async move {
            let mut lines = 0u64;
            if let Some(stdout) = stdout {
                let mut reader = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    tracing::debug!("[{}] {}", step_id, line);
                    lines += 1;
                }
            }
            lines
        };
        let stderr_text = async move {
            let mut text = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut text).await;
            }
            text
        };

        let (exit, lines, stderr) = tokio::select! {
            outcome = async { tokio::join!(child.wait(), stdout_lines, stderr_text) } => outcome,
            _ = ctx.cancellation().cancelled() => return Err(TaskError::Cancelled),
        };
        let exit = exit?;
        status.increment("stdout_lines", lines);

        for line in stderr.lines().take(10) {
            tracing::warn!("[{}] stderr: {}", ctx.step_id(), line);
        }
        if !exit.success() {
            let tail: Vec<&str> = stderr.lines().rev().take(3).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            return Err(TaskError::Failed(format!(
                "script exited with {}: {}",
                exit.code().map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()),
                tail.join(" | ")
            )));
        }
        status.set_progress(1.0);
        Ok(())
    }
}

pub struct ShellStepFactory;

impl StepFactory for ShellStepFactory {
    fn step_type(&self) -> &str {
        STEP_TYPE
    }

    fn create(&self, formats: &FormatRegistry) -> Result<Box<dyn Step>, ConfigError> {
        Ok(Box::new(ShellStep::new(formats)))
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Run a shell script with ports exported as environment variables".to_string(),
            category: "process".to_string(),
            parameters: ["script", "inputs", "outputs", "shell", "requires", "container"]
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}
