//! Probe the DLMP offline agent against a running backend.
//!
//! Provides commands for:
//! - Fetching paths through an installed agent, online and then offline
//! - Showing the notification a push payload produces
//! - Sending control messages and printing the reply
//!
//! ## Usage
//!
//! ```bash
//! # Fetch through the agent, then again with the network unplugged
//! offline-probe --origin http://localhost:3000 fetch / /api/users/me --offline
//!
//! # What would this push show?
//! offline-probe push '{"title":"Case assigned","data":{"url":"/cases/7"}}'
//!
//! # Ask the agent its version
//! offline-probe --config agent.json control '{"type":"GET_VERSION"}' --skip-install
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use dlmp_common::{init_logging, LogConfig};
use dlmp_net::{Request, ResourceLoader};
use dlmp_sw::{
    rpc_channel, Agent, AgentConfig, AgentError, ControlMessage, RecordingShell, Registration,
};
use tracing::info;

mod probe;

use probe::{
    emit, load_config, ControlOutcome, FetchOutcome, Pass, ProbeError, ProbeNetwork, PushOutcome,
};

#[derive(Parser)]
#[command(name = "offline-probe")]
#[command(about = "Drive the DLMP offline agent against a live backend")]
struct Cli {
    /// Agent configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Override the configured origin
    #[arg(long, global = true)]
    origin: Option<String>,
    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch paths through an installed and active agent
    Fetch {
        /// Paths (or absolute URLs) to fetch
        #[arg(required = true)]
        paths: Vec<String>,
        /// Fetch every path again with the network unplugged
        #[arg(long)]
        offline: bool,
        /// Issue the requests as page navigations
        #[arg(long)]
        navigate: bool,
    },

    /// Show the notification a push payload would produce
    Push {
        /// Raw push payload
        payload: String,
    },

    /// Send a control message and print the reply
    Control {
        /// Message JSON, e.g. '{"type":"GET_VERSION"}'
        message: String,
        /// Do not precache before sending
        #[arg(long)]
        skip_install: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    init_logging(if cli.verbose {
        LogConfig::debug()
    } else {
        LogConfig::default().with_filter("warn")
    });

    let config = load_config(cli.config.as_deref(), cli.origin.as_deref())?;
    info!(origin = %config.origin, version = %config.version, "Probe starting");

    match cli.command {
        Commands::Fetch {
            paths,
            offline,
            navigate,
        } => {
            let outcomes = run_fetch(config, &paths, offline, navigate).await?;
            let failed = outcomes.iter().any(|o| o.error.is_some());
            emit(&outcomes, cli.json, |outcomes| {
                outcomes
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
            if failed {
                std::process::exit(1);
            }
        }

        Commands::Push { payload } => {
            let outcome = run_push(config, &payload).await?;
            emit(&outcome, cli.json, |outcome| match outcome {
                PushOutcome::Shown { notification } => format!(
                    "Notification: {}\n  body:    {}\n  url:     {}\n  actions: {}",
                    notification.title,
                    notification.body,
                    notification.data.url.as_deref().unwrap_or("/"),
                    notification
                        .actions
                        .iter()
                        .map(|a| a.id.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
                PushOutcome::Ignored => "Push ignored".to_string(),
            })?;
        }

        Commands::Control {
            message,
            skip_install,
        } => {
            let outcome = run_control(config, &message, skip_install).await?;
            emit(&outcome, cli.json, |outcome| match outcome {
                ControlOutcome::Reply { reply } => {
                    serde_json::to_string(reply).unwrap_or_else(|e| e.to_string())
                }
                ControlOutcome::NoReply => "No reply".to_string(),
            })?;
        }
    }

    Ok(())
}

fn build_agent(config: AgentConfig, network: Arc<ProbeNetwork>) -> Result<Agent, AgentError> {
    Agent::builder(config)
        .network(network)
        .shell(Arc::new(RecordingShell::new()))
        .build()
}

async fn run_fetch(
    config: AgentConfig,
    paths: &[String],
    offline: bool,
    navigate: bool,
) -> Result<Vec<FetchOutcome>, ProbeError> {
    let network = Arc::new(ProbeNetwork::new()?);
    let agent = build_agent(config.clone(), network.clone())?;

    let (registration, _events) = Registration::new(config.origin.clone());
    let agent = registration.register(agent).await?;
    let loader = ResourceLoader::new(network.clone());
    loader.register(registration.clone()).await;

    let urls = paths
        .iter()
        .map(|p| config.resolve(p))
        .collect::<Result<Vec<_>, _>>()?;

    let passes: &[Pass] = if offline {
        &[Pass::Online, Pass::Offline]
    } else {
        &[Pass::Online]
    };

    let mut outcomes = Vec::new();
    for &pass in passes {
        if pass == Pass::Offline {
            network.unplug();
        }
        for url in &urls {
            let request = if navigate {
                Request::navigate(url.clone())
            } else {
                Request::get(url.clone())
            };
            let result = loader.fetch(request).await;
            outcomes.push(FetchOutcome::from_result(pass, url, result));
        }
        // Let background writes land before the next pass reads them.
        agent.settled().await;
    }
    Ok(outcomes)
}

async fn run_push(config: AgentConfig, payload: &str) -> Result<PushOutcome, ProbeError> {
    let shell = Arc::new(RecordingShell::new());
    let agent = Agent::builder(config)
        .network(Arc::new(ProbeNetwork::new()?))
        .shell(shell.clone())
        .build()?;

    if agent.handle_push(Some(payload.as_bytes())).await.is_none() {
        return Ok(PushOutcome::Ignored);
    }
    match shell.shown().pop() {
        Some((_, notification)) => Ok(PushOutcome::Shown { notification }),
        None => Ok(PushOutcome::Ignored),
    }
}

async fn run_control(
    config: AgentConfig,
    message: &str,
    skip_install: bool,
) -> Result<ControlOutcome, ProbeError> {
    let data: serde_json::Value = serde_json::from_str(message)?;
    let network = Arc::new(ProbeNetwork::new()?);
    let agent = build_agent(config.clone(), network)?;

    let agent = if skip_install {
        Arc::new(agent)
    } else {
        let (registration, _events) = Registration::new(config.origin.clone());
        registration.register(agent).await?
    };

    let (port, pending) = rpc_channel();
    agent
        .handle_message(ControlMessage {
            data,
            reply: Some(port),
        })
        .await;

    match pending.recv().await {
        Ok(reply) => Ok(ControlOutcome::Reply { reply }),
        Err(AgentError::ChannelClosed) => Ok(ControlOutcome::NoReply),
        Err(e) => Err(e.into()),
    }
}
