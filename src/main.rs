mod providers;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use weaver_core::config::EngineConfig;
use weaver_core::event::{EngineEvent, EventBus};
use weaver_core::step::WorkflowDefinition;
use weaver_core::types::{RunStatus, WaitMode};
use weaver_engine::{ExecuteOptions, Orchestrator, Plan};

use providers::{ChatCompletionSampler, HttpCaller};

#[derive(Parser)]
#[command(name = "weaver", version, about = "Workflow orchestration engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "weaver.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a workflow definition and print its execution order
    Validate {
        /// Workflow definition (JSON)
        file: PathBuf,
    },
    /// Run a workflow and print the result as JSON
    Run {
        /// Workflow definition (JSON)
        file: PathBuf,
        /// Input as a JSON string, or @path to read it from a file
        #[arg(long)]
        input: Option<String>,
        /// Record failed steps and keep going
        #[arg(long)]
        continue_on_error: bool,
        /// Run timeout in milliseconds (0 = unlimited)
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Wait for handles launched by async steps before exiting
        #[arg(long, value_enum)]
        wait: Option<WaitArg>,
        /// How long --wait waits (0 = no limit; default: handles.default_timeout_ms)
        #[arg(long, requires = "wait")]
        wait_timeout_ms: Option<u64>,
        /// OpenAI-compatible chat completions URL used by agent steps
        #[arg(long, env = "WEAVER_SAMPLER_URL")]
        sampler_url: Option<String>,
        /// API key for the sampler
        #[arg(long, env = "WEAVER_API_KEY", hide_env_values = true)]
        api_key: Option<String>,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum WaitArg {
    All,
    Any,
    Race,
}

impl From<WaitArg> for WaitMode {
    fn from(arg: WaitArg) -> Self {
        match arg {
            WaitArg::All => WaitMode::All,
            WaitArg::Any => WaitMode::Any,
            WaitArg::Race => WaitMode::Race,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("weaver=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "weaver", &mut std::io::stdout());
        return Ok(());
    }

    let config = if cli.config.exists() {
        EngineConfig::load(&cli.config)?
    } else {
        debug!(path = %cli.config.display(), "No config file, using defaults");
        EngineConfig::default()
    };

    match cli.command {
        Commands::Validate { file } => validate(&file),
        Commands::Run {
            file,
            input,
            continue_on_error,
            timeout_ms,
            wait,
            wait_timeout_ms,
            sampler_url,
            api_key,
        } => {
            let definition = load_definition(&file)?;
            let input = parse_input(input.as_deref())?;

            let mut builder =
                Orchestrator::builder(config).with_caller(Arc::new(HttpCaller::new()));
            match sampler_url {
                Some(url) => {
                    let sampler = ChatCompletionSampler::new(url, api_key);
                    builder = builder.with_sampler(Arc::new(sampler));
                }
                None => debug!("No sampler configured; agent steps will fail"),
            }
            let orchestrator = builder.build();

            let mut options = ExecuteOptions::default();
            if continue_on_error {
                options = options.with_continue_on_error(true);
            }
            if let Some(ms) = timeout_ms {
                options = options.with_timeout_ms(ms);
            }

            let default_wait_ms = orchestrator.config().handles.default_timeout_ms;
            let wait = wait.map(|mode| {
                (WaitMode::from(mode), wait_timeout(wait_timeout_ms, default_wait_ms))
            });
            let status = run(&orchestrator, &definition, input, options, wait).await?;
            if status != RunStatus::Completed && status != RunStatus::Launched {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }
}

fn load_definition(path: &Path) -> anyhow::Result<WorkflowDefinition> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading workflow {}", path.display()))?;
    Ok(WorkflowDefinition::from_json(&json)?)
}

fn parse_input(input: Option<&str>) -> anyhow::Result<Value> {
    let Some(input) = input else {
        return Ok(Value::Null);
    };
    let raw = match input.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading input {}", path))?,
        None => input.to_string(),
    };
    serde_json::from_str(&raw).context("input is not valid JSON")
}

fn validate(file: &Path) -> anyhow::Result<()> {
    let definition = load_definition(file)?;
    let plan = Plan::build(&definition)?;

    println!("Workflow '{}' is valid.\n", definition.name);
    println!("Execution order:");
    for (i, id) in plan.order().iter().enumerate() {
        let kind = plan.step(id).map(|s| s.step_type().as_str()).unwrap_or("?");
        println!("  {:>2}. {} ({})", i + 1, id, kind);
        for step in &definition.steps {
            if plan.owner_of(&step.id) == Some(id.as_str()) {
                println!("        - {} ({})", step.id, step.step_type());
            }
        }
    }
    Ok(())
}

async fn run(
    orchestrator: &Orchestrator,
    definition: &WorkflowDefinition,
    input: Value,
    options: ExecuteOptions,
    wait: Option<(WaitMode, Duration)>,
) -> anyhow::Result<RunStatus> {
    let shutdown = CancellationToken::new();
    let sweeper = orchestrator.registry().spawn_sweeper(shutdown.clone());
    let printer = spawn_event_printer(orchestrator.event_bus());

    // Ctrl-C cancels the run; the partial result is still printed.
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            interrupt.cancel();
        }
    });

    let result = orchestrator
        .execute_workflow(definition, input, options.with_cancel(cancel))
        .await?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    if let (Some((mode, timeout)), false) = (wait, result.pending_handles.is_empty()) {
        info!(handles = result.pending_handles.len(), ?mode, "Waiting for launched handles");
        let outcome = orchestrator
            .registry()
            .wait_for_multiple(&result.pending_handles, mode, timeout)
            .await?;
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        if mode != WaitMode::All {
            for id in outcome.pending() {
                if let Err(e) = orchestrator.registry().cancel(id).await {
                    warn!(handle_id = %id, error = %e, "Could not cancel handle");
                }
            }
        }
    }

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        error!(error = %e, "Handle sweeper panicked");
    }
    printer.abort();
    Ok(result.status)
}

/// Caller timeout for `--wait`. Zero, from the flag or the config, waits
/// without a limit.
fn wait_timeout(flag_ms: Option<u64>, default_ms: u64) -> Duration {
    match flag_ms.unwrap_or(default_ms) {
        0 => Duration::MAX,
        ms => Duration::from_millis(ms),
    }
}

fn spawn_event_printer(event_bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut rx = event_bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                EngineEvent::RunStarted { run_id, workflow_id } => {
                    info!(run_id = %run_id, workflow_id = %workflow_id, "Run started");
                }
                EngineEvent::StepStarted { step_id, kind, .. } => {
                    debug!(step_id = %step_id, kind, "Step started");
                }
                EngineEvent::StepCompleted {
                    step_id,
                    duration_ms,
                    ..
                } => {
                    info!(step_id = %step_id, duration_ms, "Step completed");
                }
                EngineEvent::StepFailed { step_id, error, .. } => {
                    warn!(step_id = %step_id, error = %error, "Step failed");
                }
                EngineEvent::StepSkipped { step_id, .. } => {
                    info!(step_id = %step_id, "Step skipped");
                }
                EngineEvent::StepLaunched {
                    step_id, handle_id, ..
                } => {
                    info!(step_id = %step_id, handle_id = %handle_id, "Step launched");
                }
                EngineEvent::RunFinished {
                    run_id,
                    status,
                    duration_ms,
                } => {
                    info!(run_id = %run_id, status = ?status, duration_ms, "Run finished");
                }
                EngineEvent::HandleCreated { handle_id, kind } => {
                    debug!(handle_id = %handle_id, kind = %kind, "Handle created");
                }
                EngineEvent::HandleResolved { handle_id, status } => {
                    info!(handle_id = %handle_id, status = %status, "Handle resolved");
                }
            }
        }
    })
}
