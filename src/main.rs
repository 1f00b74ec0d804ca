use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use conduit_core::breaker::ConsecutiveFailureBreaker;
use conduit_core::config::AppConfig;
use conduit_core::event::EventBus;
use conduit_core::flow::Flow;
use conduit_core::store::DirectoryFlowStore;
use conduit_engine::{validate_flow, GraphWalker, Services};
use conduit_trigger::{FlowScheduler, TriggerEvent};

#[derive(Parser)]
#[command(name = "conduit", version, about = "Workflow graph execution engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conduit.toml", env = "CONDUIT_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a flow and print its run report
    Run {
        /// Flow definition file, or the id of a flow in the flows directory
        flow: String,
        /// Flow input as JSON
        #[arg(short, long, default_value = "{}")]
        input: String,
        /// Print engine events to stderr as JSON lines
        #[arg(long)]
        events: bool,
    },
    /// Validate a flow definition without running it
    Validate {
        /// Flow definition file
        flow: PathBuf,
    },
    /// Run the configured schedules until interrupted
    Schedule,
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "conduit", &mut std::io::stdout());
        return Ok(());
    }

    let config = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let bus = Arc::new(EventBus::default());
    let services = Arc::new(
        Services::new(Arc::new(DirectoryFlowStore::new(config.flows_dir())))
            .with_notifier(bus.clone())
            .with_circuit_breaker(Arc::new(ConsecutiveFailureBreaker::default())),
    );
    let walker = Arc::new(GraphWalker::with_builtins(config.clone()));

    match cli.command {
        Commands::Run {
            flow,
            input,
            events,
        } => {
            let input: serde_json::Value =
                serde_json::from_str(&input).context("--input must be valid JSON")?;
            let flow = resolve_flow(&flow, &services).await?;

            let errors = validate_flow(&flow, walker.registry());
            if !errors.is_empty() {
                for e in &errors {
                    eprintln!("  {}", e);
                }
                bail!("flow '{}' failed validation ({} problems)", flow.id, errors.len());
            }

            if events {
                let mut rx = bus.subscribe();
                tokio::spawn(async move {
                    while let Ok(event) = rx.recv().await {
                        if let Ok(line) = serde_json::to_string(&event) {
                            eprintln!("{}", line);
                        }
                    }
                });
            }

            let cancel = CancellationToken::new();
            let cancel_clone = cancel.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                warn!("Interrupted, cancelling run");
                cancel_clone.cancel();
            });

            let payload = TriggerEvent::manual(input).payload();
            let report = walker.run(flow, payload, services, cancel).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.succeeded() {
                std::process::exit(1);
            }
        }
        Commands::Validate { flow } => {
            let flow = read_flow(&flow)?;
            let errors = validate_flow(&flow, walker.registry());
            if errors.is_empty() {
                println!(
                    "Flow '{}' is valid ({} nodes, {} edges)",
                    flow.id,
                    flow.nodes.len(),
                    flow.edges.len()
                );
            } else {
                println!("Flow '{}' has {} problems:", flow.id, errors.len());
                for e in &errors {
                    println!("  {}", e);
                }
                std::process::exit(1);
            }
        }
        Commands::Schedule => {
            let cancel = CancellationToken::new();
            let cancel_clone = cancel.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down scheduler...");
                cancel_clone.cancel();
            });

            let scheduler = FlowScheduler::new(&config.schedules, walker, services, cancel);
            if scheduler.jobs().is_empty() {
                warn!("No valid [[schedules]] in config");
            }
            scheduler.run().await;
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

/// A path to a flow file, or else a flow id in the configured store.
async fn resolve_flow(flow: &str, services: &Services) -> anyhow::Result<Arc<Flow>> {
    let path = Path::new(flow);
    if path.exists() {
        return Ok(Arc::new(read_flow(path)?));
    }
    services
        .flows
        .load(flow)
        .await
        .with_context(|| format!("'{}' is neither a file nor a stored flow", flow))
}

fn read_flow(path: &Path) -> anyhow::Result<Flow> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut flow =
        Flow::from_json(&content).with_context(|| format!("parsing {}", path.display()))?;
    if flow.id.is_empty() {
        if let Some(stem) = path.file_stem() {
            flow.id = stem.to_string_lossy().into_owned();
        }
    }
    Ok(flow)
}
