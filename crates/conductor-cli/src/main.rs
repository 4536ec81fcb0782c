//! CLI binary for running, resuming and validating Conductor pipelines.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use conductor_pipeline::{
    load_config, validate, CheckpointConfig, CheckpointManager, CommandAgentExecutor,
    ConductorConfig, OrchestratorConfig, PipelineEvent, PipelineOrchestrator, RunOptions,
    Severity,
};
use conductor_types::{AggregatedResult, PipelineContext};

#[derive(Parser)]
#[command(name = "conductor", version, about = "Multi-agent pipeline orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = "conductor.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline
    Run {
        /// Pipeline name (optional when the config defines exactly one)
        #[arg(short, long)]
        pipeline: Option<String>,

        /// Seed shared state, `key=value`. Values are parsed as JSON when possible.
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,

        /// Maximum number of stage executions per sequential plan.
        #[arg(long, default_value = "200")]
        max_steps: usize,

        /// Print the aggregated result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Resume a run from its checkpoint
    Resume {
        /// Run id of the checkpoint
        run_id: String,

        /// Pipeline name (optional when the config defines exactly one)
        #[arg(short, long)]
        pipeline: Option<String>,

        /// Stage to restart from (default: first stage that did not succeed)
        #[arg(long)]
        from: Option<String>,

        /// Print the aggregated result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate the pipelines of the configuration
    Validate {
        /// Only validate this pipeline
        #[arg(short, long)]
        pipeline: Option<String>,
    },

    /// Inspect and prune checkpoints
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// List checkpoints, newest first
    List,
    /// Delete checkpoints beyond the retention limits
    Gc {
        /// Keep at most this many checkpoints (overrides the config)
        #[arg(long)]
        max_count: Option<usize>,

        /// Delete checkpoints older than this many days (overrides the config)
        #[arg(long)]
        max_age_days: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run {
            pipeline,
            set,
            max_steps,
            json,
        } => {
            cmd_run(&cli.config, pipeline.as_deref(), &set, max_steps, json).await?;
        }
        Commands::Resume {
            run_id,
            pipeline,
            from,
            json,
        } => {
            cmd_resume(&cli.config, &run_id, pipeline.as_deref(), from.as_deref(), json).await?;
        }
        Commands::Validate { pipeline } => {
            cmd_validate(&cli.config, pipeline.as_deref()).await?;
        }
        Commands::Checkpoints { action } => {
            cmd_checkpoints(&cli.config, action).await?;
        }
    }

    Ok(())
}

fn build_orchestrator(config: &ConductorConfig, max_steps: usize) -> Arc<PipelineOrchestrator> {
    let orchestrator =
        PipelineOrchestrator::new(Arc::new(CommandAgentExecutor::default()), config.registry())
            .with_checkpoints(CheckpointManager::new(&config.checkpoint.dir))
            .with_config(OrchestratorConfig {
                max_steps,
                ..OrchestratorConfig::default()
            });
    tracing::debug!(
        agents = config.agents.len(),
        checkpoints = %config.checkpoint.dir.display(),
        max_steps,
        "Orchestrator ready"
    );
    Arc::new(orchestrator)
}

/// Print stage progress as events arrive.
fn spawn_progress(orchestrator: &PipelineOrchestrator) -> tokio::task::JoinHandle<()> {
    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                PipelineEvent::PipelineStarted { run_id, name } => {
                    println!("Running pipeline: {name} (run {run_id})");
                }
                PipelineEvent::StageStarted { stage_id, .. } => {
                    println!("  > {stage_id}");
                }
                PipelineEvent::StageCompleted { stage_id, result, .. } => {
                    println!("  ✓ {stage_id} ({} ms)", result.duration_ms);
                }
                PipelineEvent::StageFailed { stage_id, error, .. } => {
                    println!("  ✗ {stage_id}: {error}");
                }
                PipelineEvent::StageRetrying {
                    stage_id,
                    attempt,
                    delay_ms,
                    ..
                } => {
                    println!("  ↻ {stage_id} attempt {attempt} in {delay_ms} ms");
                }
                PipelineEvent::DecisionEvaluated {
                    stage_id, outcome, ..
                } => {
                    println!("  ? {stage_id} -> {outcome}");
                }
                PipelineEvent::PipelineCompleted { .. } | PipelineEvent::PipelineFailed { .. } => {
                    break;
                }
                PipelineEvent::CheckpointSaved { .. } => {}
            }
        }
    })
}

fn parse_assignment(raw: &str) -> anyhow::Result<(String, serde_json::Value)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("expected KEY=VALUE, got '{raw}'"))?;
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.trim().to_string(), value))
}

async fn cmd_run(
    config_path: &Path,
    pipeline: Option<&str>,
    set: &[String],
    max_steps: usize,
    json: bool,
) -> anyhow::Result<()> {
    let config = load_config(config_path).await?;
    let pipeline = config.select_pipeline(pipeline)?.clone();
    let orchestrator = build_orchestrator(&config, max_steps);

    let run_id = uuid::Uuid::new_v4().to_string();
    let context = PipelineContext::new(&run_id, &pipeline.name);
    for raw in set {
        let (key, value) = parse_assignment(raw)?;
        context.set_shared(key, value).await;
    }

    let progress = spawn_progress(&orchestrator);
    let mut run = {
        let orchestrator = Arc::clone(&orchestrator);
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            orchestrator
                .execute_pipeline(
                    &pipeline,
                    RunOptions {
                        resume_from: None,
                        context: Some(context),
                    },
                )
                .await
        })
    };

    let outcome = tokio::select! {
        joined = &mut run => joined?,
        _ = tokio::signal::ctrl_c() => {
            println!("\nInterrupted, cancelling run {run_id}");
            orchestrator.cancel_pipeline(&run_id).await;
            run.await?
        }
    };
    let _ = progress.await;
    report(outcome, &run_id, json)
}

async fn cmd_resume(
    config_path: &Path,
    run_id: &str,
    pipeline: Option<&str>,
    from: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let config = load_config(config_path).await?;
    let pipeline = config.select_pipeline(pipeline)?;
    let orchestrator = build_orchestrator(&config, OrchestratorConfig::default().max_steps);

    let progress = spawn_progress(&orchestrator);
    let outcome = orchestrator.resume_pipeline(pipeline, run_id, from).await;
    progress.abort();
    report(outcome, run_id, json)
}

fn report(
    outcome: conductor_types::Result<AggregatedResult>,
    run_id: &str,
    json: bool,
) -> anyhow::Result<()> {
    match outcome {
        Ok(result) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_summary(&result);
            }
            if !result.is_success() {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(e) => {
            if let Some(partial) = e.partial_result() {
                if json {
                    println!("{}", serde_json::to_string_pretty(partial)?);
                } else {
                    print_summary(partial);
                }
                println!("Resume with: conductor resume {run_id}");
            }
            Err(e.into())
        }
    }
}

fn print_summary(result: &AggregatedResult) {
    println!(
        "\nStages: {} total, {} succeeded, {} failed ({} ms)",
        result.total_stages, result.success_count, result.failure_count, result.total_duration_ms
    );
    for record in &result.results {
        let mark = if record.result.success { "✓" } else { "✗" };
        match &record.result.error {
            Some(error) if !record.result.success => {
                println!("  {mark} {} [{}]: {error}", record.stage_id, record.result.agent_name);
            }
            _ => println!("  {mark} {} [{}]", record.stage_id, record.result.agent_name),
        }
    }
    if !result.aggregated_output.is_empty() {
        println!("\n{}", result.aggregated_output);
    }
}

async fn cmd_validate(config_path: &Path, only: Option<&str>) -> anyhow::Result<()> {
    let config = load_config(config_path).await?;
    let registry = config.registry();
    let pipelines: Vec<_> = match only {
        Some(name) => vec![config.select_pipeline(Some(name))?],
        None => config.pipelines.iter().collect(),
    };

    let mut has_error = false;
    for pipeline in pipelines {
        let diagnostics = validate(pipeline, &registry);
        if diagnostics.is_empty() {
            println!("{}: valid", pipeline.name);
            continue;
        }
        println!("{}:", pipeline.name);
        for diag in &diagnostics {
            let severity = match diag.severity {
                Severity::Error => {
                    has_error = true;
                    "ERROR"
                }
                Severity::Warning => "WARN",
                Severity::Info => "INFO",
            };
            println!("  [{}] {}: {}", severity, diag.rule, diag.message);
            if let Some(fix) = &diag.fix {
                println!("      fix: {fix}");
            }
        }
    }

    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

async fn cmd_checkpoints(config_path: &Path, action: CheckpointAction) -> anyhow::Result<()> {
    let checkpoint = if config_path.exists() {
        load_config(config_path).await?.checkpoint
    } else {
        CheckpointConfig::default()
    };
    let manager = CheckpointManager::new(&checkpoint.dir);

    match action {
        CheckpointAction::List => {
            let summaries = manager.list().await?;
            if summaries.is_empty() {
                println!("No checkpoints in {}", manager.dir().display());
            }
            for summary in summaries {
                println!(
                    "{}  {}  {} stages  {}",
                    summary.pipeline_id,
                    summary.pipeline_name,
                    summary.completed_stages,
                    summary.created_at.to_rfc3339()
                );
            }
        }
        CheckpointAction::Gc {
            max_count,
            max_age_days,
        } => {
            let retention = CheckpointConfig {
                max_count: max_count.or(checkpoint.max_count),
                max_age_days: max_age_days.or(checkpoint.max_age_days),
                ..checkpoint
            };
            let removed = manager.gc(&retention).await?;
            println!("Removed {removed} checkpoint(s)");
        }
    }
    Ok(())
}
