use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pipecore::{ExecutionEvent, LogProgress, Pipeline, Requirement, StepSpec, TaskEvent};
use piperuntime::emergency::{guard, install_signal_handler};
use piperuntime::{check_requirements, ensure_requirements, PipeRuntime, RuntimeConfig, StepRegistry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pipeflow")]
#[command(about = "Pipeline engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a pipeline file
    Run {
        /// Path to pipeline JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Runtime configuration JSON file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a pipeline file
    Validate {
        /// Path to pipeline JSON file
        file: PathBuf,
    },

    /// List available step types
    Steps,

    /// Report the requirements of every step in a pipeline
    Check {
        /// Path to pipeline JSON file
        file: PathBuf,

        /// Install missing requirements where possible
        #[arg(long)]
        install: bool,
    },

    /// Create a new example pipeline
    Init {
        /// Output file path
        #[arg(short, long, default_value = "pipeline.json")]
        output: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn step_registry() -> StepRegistry {
    let mut registry = StepRegistry::new();
    pipesteps::register_all(&mut registry);
    registry
}

fn load_pipeline(file: &Path) -> Result<Pipeline> {
    let json = std::fs::read_to_string(file)
        .with_context(|| format!("cannot read pipeline {}", file.display()))?;
    let pipeline = serde_json::from_str(&json)
        .with_context(|| format!("invalid pipeline JSON in {}", file.display()))?;
    Ok(pipeline)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file, config, verbose } => {
            init_logging(verbose);
            run_pipeline(file, config).await?;
        }

        Commands::Validate { file } => {
            init_logging(false);
            validate_pipeline(file)?;
        }

        Commands::Steps => {
            list_steps();
        }

        Commands::Check { file, install } => {
            init_logging(false);
            check_pipeline(file, install).await?;
        }

        Commands::Init { output } => {
            create_example_pipeline(output)?;
        }
    }

    Ok(())
}

async fn run_pipeline(file: PathBuf, config: Option<PathBuf>) -> Result<()> {
    println!("🚀 Loading pipeline from: {}", file.display());
    let pipeline = load_pipeline(&file)?;

    println!("📋 Pipeline: {}", pipeline.name);
    println!("   Steps: {}", pipeline.steps.len());
    println!("   Connections: {}", pipeline.connections.len());
    println!();

    let config = match config {
        Some(path) => RuntimeConfig::load(&path)
            .with_context(|| format!("cannot load configuration {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    tracing::debug!("Runtime configuration: {:?}", config);
    let runtime = PipeRuntime::new(config, step_registry())?;
    install_signal_handler(runtime.stop_registry().clone());

    let mut events = runtime.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ExecutionEvent::RunStarted { run_id, .. } => {
                    println!("▶️  Run {} started", run_id);
                }
                ExecutionEvent::TaskStarted { step_id, .. } => {
                    println!("  ⚡ Starting step: {}", step_id);
                }
                ExecutionEvent::TaskCompleted {
                    step_id,
                    success,
                    duration_ms,
                    error,
                    ..
                } => {
                    if success {
                        println!("  ✅ Step {} completed in {}ms", step_id, duration_ms);
                    } else {
                        println!("  ❌ Step {} failed: {}", step_id, error.unwrap_or_default());
                    }
                }
                ExecutionEvent::TaskEvent { step_id, event, .. } => match event {
                    TaskEvent::Info { message } => println!("     ℹ️  [{}] {}", step_id, message),
                    TaskEvent::Warning { message } => println!("     ⚠️  [{}] {}", step_id, message),
                    _ => {}
                },
                ExecutionEvent::JobSubmitted { job_id, batch_system, .. } => {
                    println!("     🖥️  Submitted {} job {}", batch_system, job_id);
                }
                ExecutionEvent::JobStateChanged { job_id, state, .. } => {
                    println!("     🖥️  Job {} is {}", job_id, state);
                }
                ExecutionEvent::RunCompleted { success, duration_ms, .. } => {
                    if success {
                        println!("✨ Pipeline completed successfully in {}ms", duration_ms);
                    } else {
                        println!("💥 Pipeline failed after {}ms", duration_ms);
                    }
                }
                _ => {}
            }
        }
    });

    let outcome = guard(runtime.stop_registry(), runtime.run(&pipeline)).await;
    runtime.shutdown().await;

    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    event_task.abort();

    let summary = outcome?;
    println!();
    println!("📊 Run Summary:");
    println!("   Run ID: {}", summary.run_id);
    println!(
        "   Completed: {}/{} steps",
        summary.results.iter().filter(|r| r.success).count(),
        pipeline.steps.len()
    );
    if !summary.skipped.is_empty() {
        println!("   Skipped: {}", summary.skipped.join(", "));
    }
    for result in summary.failed() {
        println!("   Failed: {} ({})", result.step_id, result.error.as_deref().unwrap_or("unknown error"));
    }

    if !summary.success() {
        anyhow::bail!("pipeline {} failed", pipeline.name);
    }
    Ok(())
}

fn validate_pipeline(file: PathBuf) -> Result<()> {
    println!("🔍 Validating pipeline: {}", file.display());
    let pipeline = load_pipeline(&file)?;

    let data = pipecore::DataRegistry::standard(&RuntimeConfig::default().protocols());
    let validated = piperuntime::validate_pipeline(&pipeline, &step_registry(), data.formats())?;

    println!("✅ Pipeline is valid:");
    println!("   Name: {}", pipeline.name);
    println!("   Steps: {}", pipeline.steps.len());
    println!("   Connections: {}", pipeline.connections.len());
    println!("   Order: {}", validated.order.join(" -> "));

    Ok(())
}

fn list_steps() {
    println!("📦 Available Step Types:");
    println!();

    let registry = step_registry();
    for step_type in registry.list_step_types() {
        if let Some(metadata) = registry.get_metadata(&step_type) {
            println!("  • {} ({})", step_type, metadata.category);
            println!("    {}", metadata.description);
            if !metadata.parameters.is_empty() {
                println!("    parameters: {}", metadata.parameters.join(", "));
            }
        } else {
            println!("  • {}", step_type);
        }
    }
}

async fn check_pipeline(file: PathBuf, install: bool) -> Result<()> {
    let pipeline = load_pipeline(&file)?;
    let data = pipecore::DataRegistry::standard(&RuntimeConfig::default().protocols());
    let validated = piperuntime::validate_pipeline(&pipeline, &step_registry(), data.formats())?;

    let mut requirements: Vec<Arc<dyn Requirement>> = Vec::new();
    for step_id in &validated.order {
        if let Some(step) = validated.step(step_id) {
            for requirement in step.requirements() {
                if !requirements.iter().any(|r| r.name() == requirement.name()) {
                    requirements.push(requirement);
                }
            }
        }
    }

    println!("🔧 Requirements of {}:", pipeline.name);
    for report in check_requirements(&requirements).await {
        let mark = if report.available {
            "✅"
        } else if report.optional {
            "⚠️ "
        } else {
            "❌"
        };
        let installable = if !report.available && report.installable {
            " (installable)"
        } else {
            ""
        };
        println!("  {} {}{}", mark, report.name, installable);
    }

    if install {
        ensure_requirements(&requirements, &LogProgress).await?;
        println!("✨ All requirements satisfied");
    }
    Ok(())
}

fn create_example_pipeline(output: PathBuf) -> Result<()> {
    let mut pipeline = Pipeline::new("Example Shell Pipeline");
    pipeline.description = Some("Counts the lines of a text file and publishes the count".to_string());

    pipeline.add_step(
        StepSpec::new("count", "shell.run")
            .with_param("inputs", "source:text")
            .with_param("outputs", "count:text")
            .with_param("requires", "wc")
            .with_param("script", "wc -l < \"$IN_SOURCE\" > \"$OUT_COUNT\""),
    );
    pipeline.add_step(StepSpec::new("publish", "io.copy"));
    pipeline.connect("count", "count", "publish", "input");
    pipeline.bind_input("count", "source", ["input.txt"]);

    let json = serde_json::to_string_pretty(&pipeline)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example pipeline: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  pipeflow run --file {}", output.display());

    Ok(())
}
