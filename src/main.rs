use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use weft_core::config::{expand_home, AppConfig};
use weft_core::types::{ExecutionEvent, RunEvent, RunFilter, RunId, RunStatus, StepStatus};
use weft_core::workflow::WorkflowDefinition;
use weft_engine::{compile, ExecutionProfile, RunLogger, RunRequest, RuntimeMode, WorkflowService};
use weft_gateway::GatewayServer;

#[derive(Parser)]
#[command(name = "weft", version, about = "Declarative workflow orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "weft.toml")]
    config: PathBuf,

    /// Directory of workflow definitions (overrides [engine].workflows_dir)
    #[arg(short, long)]
    workflows: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and compile a workflow definition file
    Validate {
        /// Path to a .toml or .json definition
        file: PathBuf,
    },
    /// Print the compiled graph of a workflow
    Dag {
        /// Workflow name, or path to a definition file
        workflow: String,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Run a workflow and stream its events
    Run {
        /// Workflow name, or path to a definition file
        workflow: String,
        /// Input value as key=value (value parsed as JSON when possible)
        #[arg(short, long = "input")]
        inputs: Vec<String>,
        /// Run-level time limit in seconds
        #[arg(long)]
        max_duration: Option<u64>,
        /// Override every step's attempt budget
        #[arg(long)]
        max_attempts: Option<u32>,
        /// Do not call model backends
        #[arg(long)]
        dry_run: bool,
        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// List recorded runs
    Runs {
        #[arg(long)]
        workflow: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Show one recorded run
    Show {
        run_id: String,
        /// Also print the stored event log
        #[arg(long)]
        events: bool,
    },
    /// Aggregate figures over recorded runs
    Summary {
        #[arg(long)]
        workflow: Option<String>,
    },
    /// Start the HTTP/WebSocket gateway
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("weft=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Validation needs no config or store
    if let Commands::Validate { file } = &cli.command {
        return validate(file);
    }

    let config = load_config(&cli.config)?;
    let workflows_dir = cli
        .workflows
        .clone()
        .unwrap_or_else(|| config.workflows_dir());
    let service = Arc::new(WorkflowService::from_config(config)?);

    match cli.command {
        Commands::Validate { file } => validate(&file)?,
        Commands::Dag { workflow, json } => {
            let name = resolve_workflow(&service, &workflows_dir, &workflow).await?;
            let dag = service.describe(&name).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&dag)?);
            } else {
                println!("{} ({} steps)", dag.workflow, dag.nodes.len());
                for name in &dag.topological_order {
                    if let Some(node) = dag.nodes.iter().find(|n| &n.name == name) {
                        let deps = if node.depends_on.is_empty() {
                            String::new()
                        } else {
                            format!(" <- {}", node.depends_on.join(", "))
                        };
                        println!("  {} [{}: {}]{}", node.name, node.kind, node.handler, deps);
                    }
                }
            }
        }
        Commands::Run {
            workflow,
            inputs,
            max_duration,
            max_attempts,
            dry_run,
            json,
        } => {
            let name = resolve_workflow(&service, &workflows_dir, &workflow).await?;
            let mut request = RunRequest::new(name);
            for raw in &inputs {
                let (key, value) = parse_input(raw)?;
                request.inputs.insert(key, value);
            }
            request.profile = ExecutionProfile {
                mode: if dry_run {
                    RuntimeMode::DryRun
                } else {
                    RuntimeMode::Live
                },
                max_attempts,
                max_duration_secs: max_duration,
            };

            let logger_cancel = spawn_run_logger(&service);
            let mut handle = service.start(request).await?;

            // Ctrl-C cancels the run; the run still reports its final state.
            let cancel = handle.cancel_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling run");
                    cancel.cancel();
                }
            });

            while let Some(event) = handle.next_event().await {
                if json {
                    println!("{}", serde_json::to_string(&event)?);
                } else {
                    print_event(&event);
                }
                if event.is_terminal() {
                    break;
                }
            }
            let run = handle.wait().await?;
            if let Some(cancel) = logger_cancel {
                // Let the logger write the final line.
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            }

            if run.status != RunStatus::Success {
                anyhow::bail!(
                    "run {} finished {}{}",
                    run.run_id,
                    run.status,
                    run.error.map(|e| format!(": {}", e)).unwrap_or_default()
                );
            }
        }
        Commands::Runs {
            workflow,
            status,
            limit,
        } => {
            let status = match status {
                Some(s) => Some(
                    RunStatus::parse(&s).with_context(|| format!("unknown status '{}'", s))?,
                ),
                None => None,
            };
            let runs = service
                .list_runs(RunFilter {
                    workflow,
                    status,
                    limit: Some(limit),
                    offset: None,
                })
                .await?;
            if runs.is_empty() {
                println!("No runs recorded.");
            }
            for run in runs {
                println!(
                    "{}  {:<10} {:<20} {}  {}/{} ok",
                    run.run_id,
                    run.status,
                    run.workflow_name,
                    run.start_time.format("%Y-%m-%d %H:%M:%S"),
                    run.steps.iter().filter(|s| s.status == StepStatus::Success).count(),
                    run.steps.len(),
                );
            }
        }
        Commands::Show { run_id, events } => {
            let run_id = RunId::from_string(&run_id);
            let detail = service.get_run(&run_id).await?;
            let run = &detail.run;
            println!("Run:      {}", run.run_id);
            println!("Workflow: {}", run.workflow_name);
            println!("Status:   {}", run.status);
            if let Some(ms) = detail.duration_ms {
                println!("Duration: {}ms", ms);
            }
            println!(
                "Steps:    {:.0}% succeeded, {} failed, {} tokens",
                detail.success_rate * 100.0,
                detail.failed_count,
                detail.total_tokens
            );
            if let Some(error) = &run.error {
                println!("Error:    {}", error);
            }
            for step in &run.steps {
                print!("  {:<20} {:<10} attempts={}", step.name, step.status, step.attempt_count);
                if let Some(backend) = &step.backend_used {
                    print!(" backend={}", backend);
                }
                if let Some(error) = &step.error {
                    print!(" error={}", error);
                }
                println!();
            }
            if events {
                for event in service.run_events(&run_id).await? {
                    println!("{}", serde_json::to_string(&event)?);
                }
            }
        }
        Commands::Summary { workflow } => {
            let summary = service.summary(workflow.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Serve => {
            load_catalog(&service, &workflows_dir).await;
            let gateway_config = service.config().gateway.clone().unwrap_or_default();
            let shutdown = CancellationToken::new();
            let logger_cancel = spawn_run_logger(&service);

            let signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutting down");
                    signal.cancel();
                }
            });

            let server = GatewayServer::new(gateway_config, Arc::clone(&service));
            server.run(shutdown).await?;
            if let Some(cancel) = logger_cancel {
                cancel.cancel();
            }
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    let home_config = expand_home("~/.weft/config.toml");
    if home_config.exists() {
        info!(path = %home_config.display(), "Loading config from home directory");
        return Ok(AppConfig::load(&home_config)?);
    }
    warn!(path = %path.display(), "No config file found, using defaults");
    Ok(AppConfig::default())
}

fn validate(file: &Path) -> anyhow::Result<()> {
    let def = WorkflowDefinition::load(file)?;
    let graph = compile(&def).with_context(|| format!("{} does not compile", file.display()))?;
    let order: Vec<&str> = graph
        .topological_order()
        .iter()
        .map(|id| graph.node(*id).name.as_str())
        .collect();
    println!("{}: ok ({} steps)", def.name, graph.len());
    println!("  order: {}", order.join(" -> "));
    Ok(())
}

async fn load_catalog(service: &WorkflowService, dir: &Path) {
    if !dir.is_dir() {
        warn!(dir = %dir.display(), "Workflows directory not found");
        return;
    }
    match service.load_dir(dir).await {
        Ok(report) => {
            for (path, reason) in &report.rejected {
                eprintln!("Rejected {}: {}", path.display(), reason);
            }
        }
        Err(e) => warn!(dir = %dir.display(), error = %e, "Failed to load workflows"),
    }
}

/// Register the workflow named on the command line. A path to a definition
/// file is loaded directly; anything else is looked up in the catalog.
async fn resolve_workflow(
    service: &WorkflowService,
    dir: &Path,
    workflow: &str,
) -> anyhow::Result<String> {
    let path = Path::new(workflow);
    if path.is_file() {
        let def = WorkflowDefinition::load(path)?;
        let name = def.name.clone();
        service.register(def).await?;
        return Ok(name);
    }
    load_catalog(service, dir).await;
    Ok(workflow.to_string())
}

fn spawn_run_logger(service: &Arc<WorkflowService>) -> Option<CancellationToken> {
    let log_dir = service.config().log_dir()?;
    let cancel = CancellationToken::new();
    let logger = RunLogger::new(log_dir);
    tokio::spawn(logger.run(Arc::clone(service.event_bus()), cancel.clone()));
    Some(cancel)
}

/// Parse `key=value`; the value is JSON when it parses as JSON, else a string.
fn parse_input(raw: &str) -> anyhow::Result<(String, serde_json::Value)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("input '{}' is not key=value", raw))?;
    if key.is_empty() {
        anyhow::bail!("input '{}' has an empty key", raw);
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn print_event(event: &RunEvent) {
    match &event.event {
        ExecutionEvent::WorkflowStart {
            workflow_name,
            step_count,
        } => println!("▶ {} ({} steps) run {}", workflow_name, step_count, event.run_id),
        ExecutionEvent::StepStart { step } => println!("  … {}", step),
        ExecutionEvent::StepEnd {
            step,
            status,
            duration_ms,
            backend_used,
            attempts,
            error,
            ..
        } => {
            let mark = match status {
                StepStatus::Success => "✓",
                StepStatus::Skipped => "-",
                _ => "✗",
            };
            let mut line = format!("  {} {} {} {}ms", mark, step, status, duration_ms);
            if *attempts > 1 {
                line.push_str(&format!(" ({} attempts)", attempts));
            }
            if let Some(backend) = backend_used {
                line.push_str(&format!(" via {}", backend));
            }
            if let Some(error) = error {
                line.push_str(&format!(": {}", error));
            }
            println!("{}", line);
        }
        ExecutionEvent::WorkflowEnd {
            status,
            duration_ms,
        } => println!("■ {} in {}ms", status, duration_ms),
        ExecutionEvent::Error { message } => eprintln!("error: {}", message),
        ExecutionEvent::Keepalive => {}
    }
}
