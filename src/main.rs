use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use phaseflow_core::config::{AppConfig, PipelineFile};
use phaseflow_core::event::EventBus;
use phaseflow_core::handover::{HandoverDocument, Phase, PhaseEndpoint};
use phaseflow_core::traits::StateStore;
use phaseflow_core::types::{Payload, PipelineDefinition};

use phaseflow_engine::{spawn_run_logger, PipelineCoordinator, StageScheduler, WorkerPool};
use phaseflow_store::SqliteStateStore;
use phaseflow_tools::ToolRegistry;

#[derive(Parser)]
#[command(name = "phaseflow", version, about = "Multi-stage agent pipeline executor")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "phaseflow.toml", env = "PHASEFLOW_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every pipeline in the pipeline file
    Run {
        /// Pipeline file (overrides `pipelines` in the config)
        #[arg(short, long)]
        pipelines: Option<PathBuf>,
        /// Workflow input as a JSON object
        #[arg(short, long)]
        input: Option<String>,
    },
    /// Validate the pipeline file and print each pipeline's waves
    Validate {
        /// Pipeline file (overrides `pipelines` in the config)
        #[arg(short, long)]
        pipelines: Option<PathBuf>,
    },
    /// Show the stored state of a workflow
    Status {
        /// Workflow ID
        workflow_id: String,
    },
    /// List initialized and running workflows
    Active,
    /// Show the current configuration
    Config,
    /// Show completion gates and responsibilities for a phase (or all)
    Phases {
        /// van, plan, create, implement or review
        phase: Option<String>,
    },
    /// Derive the next phase's handover document from a handover file
    Handover {
        /// Handover document (JSON)
        file: PathBuf,
    },
    /// Check a phase's outputs against its completion gate
    Gate {
        /// van, plan, create, implement or review
        phase: String,
        /// Outputs object (JSON)
        outputs: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("phaseflow=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Run { pipelines, input } => {
            let input = parse_input(input.as_deref())?;
            let file = load_pipeline_file(&config, pipelines.as_deref())?;

            let store = open_store(&config).await?;
            let event_bus = Arc::new(EventBus::default());
            let scheduler = Arc::new(
                StageScheduler::new(
                    Arc::new(ToolRegistry::with_builtins()),
                    store,
                    WorkerPool::new(config.engine.max_concurrent_tools),
                )
                .with_event_bus(event_bus.clone()),
            );
            let coordinator = PipelineCoordinator::from_config(scheduler, &file, &config.engine)?;

            let run_id = format!("run-{}", uuid::Uuid::new_v4());
            let level = config.log.as_ref().map(|l| l.level).unwrap_or(1);
            let logger = spawn_run_logger(
                config.log_dir().as_deref(),
                level,
                event_bus.clone(),
                run_id.clone(),
            );

            let cancel = CancellationToken::new();
            let ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling pipelines");
                    ctrl_c.cancel();
                }
            });

            info!(run_id = %run_id, pipelines = coordinator.pipeline_names().len(), "Run started");
            let report = coordinator.run_all(input, cancel).await;

            if let Some((stop, handle)) = logger {
                stop.cancel();
                handle.await.ok();
            }

            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.all_completed() {
                anyhow::bail!("pipelines did not complete: {}", report.failed().join(", "));
            }
        }
        Commands::Validate { pipelines } => {
            let file = load_pipeline_file(&config, pipelines.as_deref())?;
            let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::in_memory()?);
            let scheduler = Arc::new(StageScheduler::new(
                Arc::new(ToolRegistry::with_builtins()),
                store,
                WorkerPool::new(config.engine.max_concurrent_tools),
            ));
            let coordinator = PipelineCoordinator::from_config(scheduler, &file, &config.engine)?;

            println!(
                "{} pipeline(s), at most {} in parallel",
                coordinator.pipeline_names().len(),
                coordinator.max_parallel()
            );
            for name in coordinator.pipeline_names() {
                let waves = coordinator.scheduler().plan(name)?;
                let after = coordinator
                    .definition(name)
                    .map(prerequisites)
                    .unwrap_or_default();
                if after.is_empty() {
                    println!("\n{}", name);
                } else {
                    println!("\n{} (after {})", name, after);
                }
                for (i, wave) in waves.iter().enumerate() {
                    println!("  wave {}: {}", i + 1, wave.join(", "));
                }
            }
        }
        Commands::Status { workflow_id } => {
            let store = open_store(&config).await?;
            match store.get_workflow_state(&workflow_id).await? {
                Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
                None => anyhow::bail!("workflow not found: {}", workflow_id),
            }
        }
        Commands::Active => {
            let store = open_store(&config).await?;
            let workflows = store.list_active_workflows().await?;
            if workflows.is_empty() {
                println!("No active workflows.");
            }
            for wf in &workflows {
                println!(
                    "  {:<48} {:<12} {:<12} {}",
                    wf.workflow_id,
                    wf.pipeline_name,
                    wf.status,
                    wf.updated_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Phases { phase } => {
            let phases = match phase {
                Some(p) => vec![p.parse::<Phase>()?],
                None => Phase::ALL.to_vec(),
            };
            for phase in phases {
                print_phase(phase);
            }
        }
        Commands::Handover { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let doc = HandoverDocument::from_json(&content)?;
            println!("{}", doc.next_phase().to_json()?);
        }
        Commands::Gate { phase, outputs } => {
            let phase: Phase = phase.parse()?;
            let content = std::fs::read_to_string(&outputs)
                .with_context(|| format!("reading {}", outputs.display()))?;
            let outputs: Payload = serde_json::from_str(&content)
                .with_context(|| format!("{} is not a JSON object", outputs.display()))?;

            let gaps = PhaseEndpoint::for_phase(phase).completion_gaps(&outputs);
            if gaps.is_empty() {
                println!("{} phase complete", phase);
            } else {
                println!("{} phase incomplete:", phase);
                for gap in &gaps {
                    println!("  - {}", gap);
                }
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn StateStore>> {
    let path = config.store_path();
    let store = SqliteStateStore::open(&path)
        .with_context(|| format!("opening state store at {}", path.display()))?;
    store.init_schema().await?;
    Ok(Arc::new(store))
}

fn load_pipeline_file(config: &AppConfig, path: Option<&Path>) -> anyhow::Result<PipelineFile> {
    let path = path
        .map(Path::to_path_buf)
        .or_else(|| config.pipelines_path())
        .context("no pipeline file: pass --pipelines or set `pipelines` in the config")?;
    Ok(PipelineFile::load(&path)?)
}

fn parse_input(input: Option<&str>) -> anyhow::Result<Payload> {
    match input {
        Some(json) => serde_json::from_str(json).context("--input must be a JSON object"),
        None => Ok(Payload::new()),
    }
}

/// Comma-separated prerequisite pipelines, in name order.
fn prerequisites(definition: &PipelineDefinition) -> String {
    definition
        .depends_on
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn print_phase(phase: Phase) {
    let endpoint = phase.endpoint();
    let duties = phase.responsibility();

    println!("{} ({} -> {})", phase, phase.agent_id(), phase.next().agent_id());
    println!("  required outputs: {}", endpoint.required_outputs.join(", "));
    for (key, expected) in endpoint.success_criteria {
        println!("  criterion:        {} = {}", key, expected);
    }
    for (metric, minimum) in endpoint.quality_thresholds {
        println!("  threshold:        {} >= {}", metric, minimum);
    }
    println!("  primary tasks:    {}", duties.primary_tasks.join(", "));
    println!("  allowed:          {}", duties.allowed_actions.join(", "));
    println!("  forbidden:        {}", duties.forbidden_actions.join(", "));
    println!("  output formats:   {}", duties.output_formats.join(", "));
    println!();
}
