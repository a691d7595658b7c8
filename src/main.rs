//! relay-stack
//!
//! Usage:
//! - Edge router: `relay-stack router --port 80 --static-root /usr/share/app`
//! - Backend: `relay-stack backend` (port from `PORT`, default 3000)
//! - Release agent: `relay-stack agent`
//! - One-shot release: `relay-stack release --branch main`
//! - Print the compose descriptor: `relay-stack descriptor`

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use relay_stack::config::{
    AgentConfig, BackendConfig, OrchestrationDescriptor, PipelineConfig, RouterConfig,
};
use relay_stack::domain::pipeline::{PipelineState, TriggerRequest};

#[derive(Parser)]
#[command(name = "relay-stack", version, about = "Edge router, backend and release pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve static assets and proxy /api to the backend
    Router {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        static_root: Option<PathBuf>,
        #[arg(long)]
        backend_url: Option<String>,
    },
    /// Fixed-greeting backend service
    Backend {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Pipeline control API (trigger, approve, cancel, log stream)
    Agent {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run one pipeline in the foreground
    Release {
        #[arg(long, env = "CI_COMMIT_BRANCH")]
        branch: String,
        #[arg(long, env = "CI_COMMIT_SHA")]
        commit: Option<String>,
        /// Answer a manual deploy gate up front
        #[arg(long)]
        approve: bool,
    },
    /// Print the orchestration descriptor as compose YAML
    Descriptor {
        /// Ignore the compose file on disk
        #[arg(long)]
        standard: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    relay_stack::init_tracing();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "Failed to create runtime");
            std::process::exit(1);
        }
    };

    match runtime.block_on(dispatch(cli.command)) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            tracing::error!(error = format!("{:#}", e), "Exiting");
            std::process::exit(1);
        }
    }
}

/// `Ok(false)` when the command ran but did not succeed
async fn dispatch(command: Command) -> anyhow::Result<bool> {
    match command {
        Command::Router {
            port,
            static_root,
            backend_url,
        } => {
            let mut config = RouterConfig::from_env();
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(root) = static_root {
                config.static_root = root;
            }
            if let Some(url) = backend_url {
                config.backend_url = url.trim_end_matches('/').to_string();
            }
            relay_stack::run_router(config).await?;
        }
        Command::Backend { port } => {
            let mut config = BackendConfig::from_env();
            if let Some(port) = port {
                config.port = port;
            }
            relay_stack::run_backend(config).await?;
        }
        Command::Agent { port } => {
            let mut config = AgentConfig::from_env();
            if let Some(port) = port {
                config.port = port;
            }
            relay_stack::run_agent(config).await?;
        }
        Command::Release {
            branch,
            commit,
            approve,
        } => {
            let request = TriggerRequest {
                branch,
                commit_sha: commit,
            };
            let state = relay_stack::run_release(PipelineConfig::from_env(), request, approve).await?;
            tracing::info!(state = state.as_str(), "Release finished");
            return Ok(state == PipelineState::Done);
        }
        Command::Descriptor { standard } => {
            let config = PipelineConfig::from_env();
            let descriptor = if standard {
                OrchestrationDescriptor::standard(&config.registry.image_prefix)?
            } else {
                OrchestrationDescriptor::load_or_standard(
                    &config.compose_path(),
                    &config.registry.image_prefix,
                )?
            };
            print!("{}", descriptor.to_yaml()?);
        }
    }
    Ok(true)
}
