#![allow(dead_code)]

use async_trait::async_trait;
use pipecore::{
    Cardinality, ConfigError, DataRegistry, FormatRegistry, Port, Ports, ProtocolSettings, Step, TaskContext,
    TaskError, TaskStatus,
};
use piperuntime::{get_or_compute, StepFactory, StepRegistry, StorageKey};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub fn data_registry() -> Arc<DataRegistry> {
    Arc::new(DataRegistry::standard(&ProtocolSettings::default()))
}

/// A step with no ports running an arbitrary async body.
pub struct FnStep<F> {
    ports: Ports,
    body: F,
    command: Option<Vec<String>>,
}

impl<F, Fut> FnStep<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), TaskError>> + Send,
{
    pub fn new(body: F) -> Self {
        Self {
            ports: Ports::new(),
            body,
            command: None,
        }
    }

    pub fn with_command(mut self, command: &[&str]) -> Self {
        self.command = Some(command.iter().map(|s| s.to_string()).collect());
        self
    }
}

#[async_trait]
impl<F, Fut> Step for FnStep<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), TaskError>> + Send,
{
    fn step_type(&self) -> &str {
        "test.fn"
    }

    fn input_ports(&self) -> &Ports {
        &self.ports
    }

    fn output_ports(&self) -> &Ports {
        &self.ports
    }

    fn command_line(&self, _ctx: &TaskContext) -> Option<Vec<String>> {
        self.command.clone()
    }

    async fn execute(&self, ctx: &TaskContext, _status: &mut TaskStatus) -> Result<(), TaskError> {
        (self.body)(ctx.clone()).await
    }
}

pub fn empty_context(step_id: &str) -> TaskContext {
    let ports = Ports::new();
    TaskContext::builder(step_id, "test.fn", &ports, &ports)
        .build()
        .unwrap()
}

/// Tracks how many bodies run at once.
#[derive(Default)]
pub struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    pub async fn hold(&self, duration: Duration) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(duration).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// `test.emit`: writes its `text` parameter to `out`.
pub struct Emit {
    inputs: Ports,
    outputs: Ports,
    text: String,
}

#[async_trait]
impl Step for Emit {
    fn step_type(&self) -> &str {
        "test.emit"
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
                "text" => self.text = value.clone(),
                _ => return Err(ConfigError::UnknownParameter(name.clone())),
            }
        }
        Ok(())
    }

    async fn execute(&self, ctx: &TaskContext, status: &mut TaskStatus) -> Result<(), TaskError> {
        write_output(ctx, "out", self.text.as_bytes()).await?;
        status.increment("bytes", self.text.len() as u64);
        Ok(())
    }
}

/// `test.upper`: upper-cases `in` into `out`.
pub struct Upper {
    inputs: Ports,
    outputs: Ports,
}

#[async_trait]
impl Step for Upper {
    fn step_type(&self) -> &str {
        "test.upper"
    }

    fn input_ports(&self) -> &Ports {
        &self.inputs
    }

    fn output_ports(&self) -> &Ports {
        &self.outputs
    }

    async fn execute(&self, ctx: &TaskContext, _status: &mut TaskStatus) -> Result<(), TaskError> {
        let text = read_input(ctx, "in").await?;
        write_output(ctx, "out", text.to_uppercase().as_bytes()).await
    }
}

/// `test.join`: concatenates `left` and `right`.
pub struct Join {
    inputs: Ports,
    outputs: Ports,
}

#[async_trait]
impl Step for Join {
    fn step_type(&self) -> &str {
        "test.join"
    }

    fn input_ports(&self) -> &Ports {
        &self.inputs
    }

    fn output_ports(&self) -> &Ports {
        &self.outputs
    }

    async fn execute(&self, ctx: &TaskContext, _status: &mut TaskStatus) -> Result<(), TaskError> {
        let left = read_input(ctx, "left").await?;
        let right = read_input(ctx, "right").await?;
        write_output(ctx, "out", format!("{}{}", left, right).as_bytes()).await
    }
}

/// `test.fail`: always fails.
pub struct Fail {
    inputs: Ports,
    outputs: Ports,
}

#[async_trait]
impl Step for Fail {
    fn step_type(&self) -> &str {
        "test.fail"
    }

    fn input_ports(&self) -> &Ports {
        &self.inputs
    }

    fn output_ports(&self) -> &Ports {
        &self.outputs
    }

    async fn execute(&self, _ctx: &TaskContext, _status: &mut TaskStatus) -> Result<(), TaskError> {
        Err(TaskError::Failed("bad input".to_string()))
    }
}

/// `test.cached`: builds a shared artifact through the context's store.
/// The step that builds it writes "built" to `out` and counts `computed`;
/// later ones write "reused". `after` only orders steps.
pub struct Cached {
    inputs: Ports,
    outputs: Ports,
}

#[async_trait]
impl Step for Cached {
    fn step_type(&self) -> &str {
        "test.cached"
    }

    fn input_ports(&self) -> &Ports {
        &self.inputs
    }

    fn output_ports(&self) -> &Ports {
        &self.outputs
    }

    async fn execute(&self, ctx: &TaskContext, status: &mut TaskStatus) -> Result<(), TaskError> {
        let store = ctx
            .store()
            .ok_or_else(|| TaskError::Failed("no artifact store".to_string()))?;
        let out = ctx
            .require_output("out")?
            .file()
            .cloned()
            .ok_or_else(|| TaskError::Failed("out has no file".to_string()))?;

        let computed = AtomicBool::new(false);
        let flag = &computed;
        let key = StorageKey::new("test.index", "fp-test");
        get_or_compute(store, &key, || async move {
            flag.store(true, Ordering::SeqCst);
            write_output(ctx, "out", b"built").await?;
            Ok::<_, TaskError>(out)
        })
        .await?;

        if computed.load(Ordering::SeqCst) {
            status.increment("computed", 1);
        } else {
            write_output(ctx, "out", b"reused").await?;
        }
        Ok(())
    }
}

pub async fn read_input(ctx: &TaskContext, port: &str) -> Result<String, TaskError> {
    let file = ctx
        .require_input(port)?
        .file()
        .ok_or_else(|| TaskError::Failed(format!("{} has no file", port)))?;
    let mut reader = file.open().await?;
    let mut text = String::new();
    reader.read_to_string(&mut text).await?;
    Ok(text)
}

pub async fn write_output(ctx: &TaskContext, port: &str, bytes: &[u8]) -> Result<(), TaskError> {
    let file = ctx
        .require_output(port)?
        .file()
        .ok_or_else(|| TaskError::Failed(format!("{} has no file", port)))?;
    let mut writer = file.create().await?;
    writer.write_all(bytes).await?;
    writer.shutdown().await?;
    Ok(())
}

fn text_ports(formats: &FormatRegistry, names: &[&str]) -> Result<Ports, ConfigError> {
    let mut ports = Ports::new();
    for name in names {
        ports.add_port(*name, formats.require("text")?)?;
    }
    Ok(ports)
}

struct Factory {
    step_type: &'static str,
    build: fn(&FormatRegistry) -> Result<Box<dyn Step>, ConfigError>,
}

impl StepFactory for Factory {
    fn step_type(&self) -> &str {
        self.step_type
    }

    fn create(&self, formats: &FormatRegistry) -> Result<Box<dyn Step>, ConfigError> {
        (self.build)(formats)
    }
}

pub fn step_registry() -> StepRegistry {
    let mut registry = StepRegistry::new();
    registry.register(Arc::new(Factory {
        step_type: "test.emit",
        build: |formats| {
            Ok(Box::new(Emit {
                inputs: Ports::new(),
                outputs: text_ports(formats, &["out"])?,
                text: String::new(),
            }))
        },
    }));
    registry.register(Arc::new(Factory {
        step_type: "test.upper",
        build: |formats| {
            Ok(Box::new(Upper {
                inputs: text_ports(formats, &["in"])?,
                outputs: text_ports(formats, &["out"])?,
            }))
        },
    }));
    registry.register(Arc::new(Factory {
        step_type: "test.join",
        build: |formats| {
            Ok(Box::new(Join {
                inputs: text_ports(formats, &["left", "right"])?,
                outputs: text_ports(formats, &["out"])?,
            }))
        },
    }));
    registry.register(Arc::new(Factory {
        step_type: "test.cached",
        build: |formats| {
            let mut inputs = Ports::new();
            inputs.add(Port::new("after", formats.require("text")?).with_cardinality(Cardinality::Optional))?;
            Ok(Box::new(Cached {
                inputs,
                outputs: text_ports(formats, &["out"])?,
            }))
        },
    }));
    registry.register(Arc::new(Factory {
        step_type: "test.fail",
        build: |formats| {
            Ok(Box::new(Fail {
                inputs: text_ports(formats, &["in"])?,
                outputs: text_ports(formats, &["out"])?,
            }))
        },
    }));
    registry
}
