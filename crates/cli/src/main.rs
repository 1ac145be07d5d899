//! `bovi-flow` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate`: load a flow definition JSON file and report its start node.
//! - `run`: run a flow to the end and print its node outputs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bus::EventBus;
use clap::{ArgAction, Args, Parser, Subcommand};
use engine::{FlowRunner, FlowSpec, FlowState, RunnerConfig};
use nodes::NodeExecutor;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const MODES: [&str; 4] = ["V", "I", "B", "O"];

#[derive(Parser)]
#[command(name = "bovi-flow", about = "Run BOVI flow definitions", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a flow definition JSON file.
    Validate {
        /// Path to the flow JSON file.
        path: PathBuf,
    },
    /// Run a flow until it completes or fails, then print its node outputs.
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Path to the flow JSON file.
    path: PathBuf,

    /// Wait for node countdowns (`false` runs default actions immediately).
    #[arg(long, env = "BOVI_AI_BUTLER", default_value_t = true, action = ArgAction::Set)]
    ai_butler: bool,

    /// Apply ACTION to NODE as soon as its countdown starts.
    #[arg(long = "override", value_name = "NODE=ACTION", value_parser = parse_pair)]
    overrides: Vec<(String, String)>,

    /// Extra context data.  Values that are not valid JSON are taken as strings.
    #[arg(long = "context", value_name = "KEY=JSON", value_parser = parse_pair)]
    context: Vec<(String, String)>,

    /// Seed for `V.Assess` randomness.
    #[arg(long, env = "BOVI_SEED")]
    seed: Option<u64>,

    /// Stop the flow and fail if it has not finished after this many seconds.
    #[arg(long, default_value_t = 600)]
    deadline_s: u64,
}

fn parse_pair(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    Ok((key.trim().to_owned(), value.to_owned()))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { path } => validate(&path),
        Command::Run(args) => run(args).await,
    }
}

fn load_spec(path: &Path) -> Result<FlowSpec> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("{} is not a valid flow definition", path.display()))
}

fn validate(path: &Path) -> Result<()> {
    let spec = load_spec(path)?;
    let flow_id = spec.id.clone();
    let runner = FlowRunner::new(EventBus::new());
    runner
        .load_flow(spec)
        .with_context(|| format!("flow '{flow_id}' failed validation"))?;

    match runner.start_node(&flow_id) {
        Some(start) => println!("flow '{flow_id}' is valid; execution starts at '{start}'"),
        None => println!("flow '{flow_id}' is valid; it has no start node and completes immediately"),
    }
    Ok(())
}

async fn run(args: RunArgs) -> Result<()> {
    let spec = load_spec(&args.path)?;
    let flow_id = spec.id.clone();

    let bus = EventBus::new();
    let mut executor = NodeExecutor::new(bus.clone());
    if let Some(seed) = args.seed {
        executor = executor.with_rng(StdRng::seed_from_u64(seed));
    }
    let runner = FlowRunner::with_executor(
        bus.clone(),
        executor,
        RunnerConfig {
            ai_butler_default: args.ai_butler,
            ..Default::default()
        },
    );
    runner
        .load_flow(spec)
        .with_context(|| format!("flow '{flow_id}' failed validation"))?;

    bus.on_any(|event| info!(event = %event.name, payload = %event.payload, "event"));

    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<()>();
    for name in ["flow.completed", "flow.error"] {
        let tx = done_tx.clone();
        bus.on(name, move |_| {
            let _ = tx.send(());
        });
    }

    // Overrides are applied from this task, after the countdown is registered.
    let (override_tx, mut override_rx) = mpsc::unbounded_channel::<(String, String)>();
    let overrides: HashMap<String, String> = args.overrides.into_iter().collect();
    if !overrides.is_empty() {
        for mode in MODES {
            let tx = override_tx.clone();
            let overrides = overrides.clone();
            let flow = flow_id.clone();
            bus.on(&format!("{mode}.default.started"), move |event| {
                if event.str_field("flow") != Some(flow.as_str()) {
                    return;
                }
                let Some(node) = event.str_field("node") else {
                    return;
                };
                if let Some(action) = overrides.get(node) {
                    let _ = tx.send((node.to_owned(), action.clone()));
                }
            });
        }
    }

    let initial: Map<String, Value> = args
        .context
        .into_iter()
        .map(|(key, raw)| {
            let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
            (key, value)
        })
        .collect();
    runner.start_flow(&flow_id, (!initial.is_empty()).then_some(initial));

    let deadline = tokio::time::sleep(Duration::from_secs(args.deadline_s));
    tokio::pin!(deadline);
    loop {
        match runner.get_flow_state(&flow_id) {
            FlowState::Completed | FlowState::Error => break,
            FlowState::Idle => bail!("flow '{flow_id}' is not running"),
            FlowState::Running => {}
        }
        tokio::select! {
            Some((node, action)) = override_rx.recv() => {
                if !runner.override_action(&flow_id, &node, &action) {
                    warn!(node = %node, action = %action, "scheduled override was not applied");
                }
            }
            Some(()) = done_rx.recv() => {}
            _ = &mut deadline => {
                runner.stop_flow(&flow_id);
                bail!("flow '{flow_id}' did not finish within {}s", args.deadline_s);
            }
        }
    }

    let ctx = runner
        .context(&flow_id)
        .with_context(|| format!("context of flow '{flow_id}' disappeared"))?;
    println!("{}", serde_json::to_string_pretty(&ctx.node_outputs)?);

    if let Some(failure) = ctx.error {
        bail!(
            "flow '{flow_id}' failed at node '{}': {}",
            failure.node.as_deref().unwrap_or("?"),
            failure.message
        );
    }
    Ok(())
}
