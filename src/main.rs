mod bootstrap;
mod run;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::bail;
use clap::{CommandFactory, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stepwise_core::config::AppConfig;
use stepwise_core::error::StepwiseError;
use stepwise_engine::{Decision, RunStatus};

/// How often `serve` looks for approvals past their deadline.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "stepwise", version, about = "Workflow graph execution engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "stepwise.toml", env = "STEPWISE_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a graph document without running it
    Validate {
        /// Graph JSON file
        graph: PathBuf,
    },
    /// Execute a graph and print its events as JSON lines
    Run {
        /// Graph JSON file
        graph: PathBuf,
        /// Run input as key=value (repeatable)
        #[arg(short, long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,
        /// Approve every approval gate without asking
        #[arg(long, conflicts_with = "reject")]
        approve: bool,
        /// Reject every approval gate without asking
        #[arg(long)]
        reject: bool,
    },
    /// Start the HTTP gateway
    Serve,
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
    // stdout carries run events, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("stepwise=info,warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "stepwise", &mut std::io::stdout());
        }
        Commands::Validate { graph } => validate(&graph)?,
        Commands::Config => {
            let config = load_config(&cli.config)?;
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Run {
            graph,
            inputs,
            approve,
            reject,
        } => {
            let config = load_config(&cli.config)?;
            let graph = run::load_graph(&graph)?;
            let inputs = run::parse_inputs(&inputs)?;
            let decision = match (approve, reject) {
                (true, _) => Some(Decision::Approve),
                (_, true) => Some(Decision::Reject),
                _ => None,
            };

            let runtime = bootstrap::build(&config).await?;
            let summary = run::run_to_end(&runtime.manager, graph, inputs, decision).await;
            runtime.mcp.disconnect_all().await;

            let summary = summary?;
            if summary.status == RunStatus::Failed {
                let node = summary.node_id.as_deref().unwrap_or("-");
                let message = summary
                    .error
                    .as_ref()
                    .and_then(|e| e["message"].as_str())
                    .unwrap_or("unknown error");
                bail!("run {} failed at node {}: {}", summary.run_id, node, message);
            }
        }
        Commands::Serve => {
            let config = load_config(&cli.config)?;
            let gateway_config = config.gateway.clone().unwrap_or_default();
            let runtime = bootstrap::build(&config).await?;

            let cancel = tokio_util::sync::CancellationToken::new();
            let cancel_clone = cancel.clone();

            // Graceful shutdown on Ctrl-C
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down gateway...");
                cancel_clone.cancel();
            });

            tokio::spawn(
                runtime
                    .manager
                    .clone()
                    .run_sweeper(SWEEP_INTERVAL, cancel.clone()),
            );

            info!(bind = %gateway_config.bind, "Starting HTTP gateway");
            let server = stepwise_gateway::GatewayServer::new(gateway_config, runtime.manager);
            server.run(cancel).await?;
            runtime.mcp.disconnect_all().await;
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    match AppConfig::load(path) {
        Ok(config) => Ok(config),
        Err(StepwiseError::ConfigNotFound(p)) => {
            bail!("config file {} not found; create one with at least a [model] section", p)
        }
        Err(e) => Err(e.into()),
    }
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let checked = run::load_graph(path).and_then(|graph| Ok(graph.validate()?));
    match checked {
        Ok(()) => {
            println!("{}: valid", path.display());
            Ok(())
        }
        Err(e) => {
            if let Some(StepwiseError::Validation {
                node_id: Some(node),
                ..
            }) = e.downcast_ref::<StepwiseError>()
            {
                warn!(node_id = %node, "Graph rejected");
            }
            bail!("{}: {}", path.display(), e)
        }
    }
}
