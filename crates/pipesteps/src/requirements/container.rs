use async_trait::async_trait;
use pipecore::{parse_flag, ConfigError, DependencyError, ProgressSink, Requirement};
use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

/// A container image that must be present in the local image store.
/// Missing images are pulled when the requirement is installable.
#[derive(Debug, Clone)]
pub struct ContainerImageRequirement {
    name: String,
    image: String,
    tag: String,
    runtime: String,
    optional: bool,
    installable: bool,
}

impl ContainerImageRequirement {
    /// `image` may carry its own tag (`biocontainers/bwa:0.7.17`).
    pub fn for_image(image: &str) -> Self {
        let (image, tag) = split_tag(image);
        let mut requirement = Self {
            name: String::new(),
            image: image.to_string(),
            tag: tag.unwrap_or("latest").to_string(),
            runtime: "docker".to_string(),
            optional: false,
            installable: true,
        };
        requirement.rename();
        requirement
    }

    /// `image:tag`
    pub fn reference(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }

    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    fn rename(&mut self) {
        self.name = format!("container:{}", self.reference());
    }
}

/// Splits a trailing tag off an image name. A colon inside a registry host
/// (`localhost:5000/tool`) is not a tag.
fn split_tag(image: &str) -> (&str, Option<&str>) {
    match image.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name, Some(tag)),
        _ => (image, None),
    }
}

#[async_trait]
impl Requirement for ContainerImageRequirement {
    fn name(&self) -> &str {
        &self.name
    }

    fn optional(&self) -> bool {
        self.optional
    }

    fn installable(&self) -> bool {
        self.installable
    }

    fn configure(&mut self, params: &HashMap<String, String>) -> Result<(), ConfigError> {
        for (key, value) in params {
            match key.as_str() {
                "optional" => self.optional = parse_flag(key, value)?,
                "installable" => self.installable = parse_flag(key, value)?,
                "image" => {
                    let (image, tag) = split_tag(value.trim());
                    if image.is_empty() {
                        return Err(ConfigError::invalid_parameter(key, "image name is empty"));
                    }
                    self.image = image.to_string();
                    if let Some(tag) = tag {
                        self.tag = tag.to_string();
                    }
                }
                "tag" => self.tag = value.trim().to_string(),
                "runtime" => self.runtime = value.trim().to_string(),
                _ => return Err(ConfigError::UnknownParameter(key.clone())),
            }
        }
        if self.tag.is_empty() {
            return Err(ConfigError::invalid_parameter("tag", "tag is empty"));
        }
        self.rename();
        Ok(())
    }

    async fn is_available(&self) -> bool {
        let status = Command::new(&self.runtime)
            .args(["image", "inspect", &self.reference()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;
        match status {
            Ok(status) => status.success(),
            Err(e) => {
                tracing::debug!("Cannot run {}: {}", self.runtime, e);
                false
            }
        }
    }

    async fn install(&self, progress: &dyn ProgressSink) -> Result<(), DependencyError> {
        let failed = |reason: String| DependencyError::InstallFailed {
            name: self.name.clone(),
            reason,
        };

        tracing::info!("Pulling image: {}", self.reference());
        progress.report(&self.name, 0.0, "pulling");

        let mut child = Command::new(&self.runtime)
            .args(["pull", &self.reference()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| failed(format!("cannot run {}: {}", self.runtime, e)))?;

        let stderr = child.stderr.take();
        let stderr_text = async move {
            let mut text = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut text).await;
            }
            text
        };

        let mut tracker = PullProgress::default();
        let stdout = child.stdout.take();
        let follow = async {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(fraction) = tracker.observe(&line) {
                        progress.report(&self.name, fraction, line.trim());
                    }
                }
            }
        };

        let (status, (), stderr) = tokio::join!(child.wait(), follow, stderr_text);
        let status = status.map_err(|e| failed(e.to_string()))?;
        if !status.success() {
            let reason = stderr.lines().last().unwrap_or("pull failed").trim().to_string();
            return Err(failed(reason));
        }
        if !self.is_available().await {
            return Err(failed("image still not present after pull".to_string()));
        }

        progress.report(&self.name, 1.0, "pulled");
        tracing::info!("Image pulled successfully: {}", self.reference());
        Ok(())
    }
}

/// Follows `pull` output and turns per-layer lines into an overall fraction.
#[derive(Debug, Default)]
pub struct PullProgress {
    layers: HashSet<String>,
    done: HashSet<String>,
}

impl PullProgress {
    /// Returns the new fraction when `line` changes it.
    pub fn observe(&mut self, line: &str) -> Option<f64> {
        let (layer, message) = line.trim().split_once(": ")?;
        if layer.is_empty() || layer.contains(' ') {
            return None;
        }
        match message.trim() {
            "Pulling fs layer" | "Waiting" => {
                if !self.layers.insert(layer.to_string()) {
                    return None;
                }
            }
            "Pull complete" | "Already exists" => {
                self.layers.insert(layer.to_string());
                if !self.done.insert(layer.to_string()) {
                    return None;
                }
            }
            _ => return None,
        }
        Some(self.fraction())
    }

    pub fn fraction(&self) -> f64 {
        if self.layers.is_empty() {
            0.0
        } else {
            self.done.len() as f64 / self.layers.len() as f64
        }
    }
}
