//! relay-stack
//!
//! Edge router, backend responder and release pipeline for a static frontend
//! plus backend deployed with docker compose.

pub mod api;
pub mod backend;
pub mod config;
pub mod domain;
pub mod edge;
pub mod error;
pub mod infra;
pub mod middleware;
pub mod pipeline;
pub mod state;

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::env::constants::VERSION;
use crate::config::{AgentConfig, BackendConfig, OrchestrationDescriptor, PipelineConfig, RouterConfig};
use crate::domain::pipeline::{DeployGate, LogLine, PipelineState, TriggerRequest};
use crate::infra::CommandRunner;
use crate::pipeline::ReleasePipeline;
use crate::state::{AppState, LogHub, RunLog, RunStore};

/// Interval of the history / log channel cleanup
const CLEANUP_INTERVAL_SECS: u64 = 3600;

/// Finished runs keep their log channel this long
const LOG_RETENTION_HOURS: i64 = 24;

/// `RUST_LOG` filter, `info` when unset
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // a second init (tests, embedding) is not an error
    let _ = fmt().with_env_filter(filter).try_init();
}

async fn bind(port: u16) -> anyhow::Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))
}

/// Edge router on `config.port`
pub async fn run_router(config: RouterConfig) -> anyhow::Result<()> {
    info!(
        port = config.port,
        static_root = %config.static_root.display(),
        backend = %config.backend_url,
        upstream_timeout = ?config.upstream_timeout,
        "Starting edge router v{}",
        VERSION
    );

    let listener = bind(config.port).await?;
    let app = edge::router(config)?;

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("edge router failed")?;

    info!("Edge router stopped");
    Ok(())
}

/// Backend responder on `config.port`
pub async fn run_backend(config: BackendConfig) -> anyhow::Result<()> {
    info!(port = config.port, "Starting backend v{}", VERSION);

    let listener = bind(config.port).await?;
    axum::serve(listener, backend::router())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("backend failed")?;

    info!("Backend stopped");
    Ok(())
}

/// Pipeline control server
pub async fn run_agent(config: AgentConfig) -> anyhow::Result<()> {
    info!(port = config.port, "Starting release agent v{}", VERSION);

    let port = config.port;
    let state = Arc::new(AppState::new(config).context("failed to load the orchestration descriptor")?);

    let shutdown = CancellationToken::new();
    let cleanup = spawn_cleanup(state.pipeline.clone(), shutdown.clone());

    let listener = bind(port).await?;
    let result = axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("release agent failed");

    shutdown.cancel();
    let _ = cleanup.await;
    result?;

    info!("Release agent stopped");
    Ok(())
}

fn spawn_cleanup(pipeline: Arc<ReleasePipeline>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(CLEANUP_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => pipeline.cleanup(LOG_RETENTION_HOURS).await,
            }
        }
    })
}

/// One pipeline run in the foreground, printing its log
///
/// A manual gate cannot be answered from here, so `approve` must be set.
pub async fn run_release(
    mut config: PipelineConfig,
    request: TriggerRequest,
    approve: bool,
) -> anyhow::Result<PipelineState> {
    if config.gate == DeployGate::Manual {
        if !approve {
            anyhow::bail!(
                "deploy gate is manual: pass --approve to release from the command line, \
                 or trigger through the agent and approve the run there"
            );
        }
        config.gate = DeployGate::Automatic;
    }

    let descriptor =
        OrchestrationDescriptor::load_or_standard(&config.compose_path(), &config.registry.image_prefix)?;
    let logs = Arc::new(LogHub::new());
    let pipeline = ReleasePipeline::new(
        config,
        descriptor,
        Arc::new(CommandRunner),
        Arc::new(RunStore::new()),
        logs.clone(),
    );

    let run = pipeline.prepare(request).await?;
    let printer = match logs.get(&run.id).await {
        Some(log) => Some(tokio::spawn(print_log(log))),
        None => None,
    };

    let state = pipeline.run(&run.id).await?;
    if let Some(printer) = printer {
        let _ = printer.await;
    }
    Ok(state)
}

fn print_line(line: &LogLine) {
    if line.stream == "stderr" {
        eprintln!("{}", line.content);
    } else {
        println!("{}", line.content);
    }
}

async fn print_log(log: Arc<RunLog>) {
    let (backlog, mut rx) = log.subscribe();
    let mut finished = log.watch_finished();
    backlog.iter().for_each(print_line);

    loop {
        let done = *finished.borrow();
        if done {
            break;
        }
        tokio::select! {
            msg = rx.recv() => match msg {
                Ok(line) => print_line(&line),
                Err(RecvError::Lagged(n)) => warn!(lagged = n, "Log printer lagged"),
                Err(RecvError::Closed) => return,
            },
            changed = finished.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    loop {
        match rx.try_recv() {
            Ok(line) => print_line(&line),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
}

/// Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::net::SocketAddr;

    pub async fn serve(app: axum::Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind listener");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move { axum::serve(listener, app).await.expect("serve app") });
        addr
    }

    pub async fn serve_with_connect_info(app: axum::Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind listener");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .await
                .expect("serve app")
        });
        addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_release_refuses_unanswerable_manual_gate() {
        let mut config = PipelineConfig::from_source(|_| None);
        config.gate = DeployGate::Manual;
        let request = TriggerRequest {
            branch: "main".to_string(),
            commit_sha: None,
        };
        let err = run_release(config, request, false).await.unwrap_err();
        assert!(err.to_string().contains("--approve"));
    }

    #[tokio::test]
    async fn test_release_rejects_non_main_branch() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::from_source(|_| None);
        config.gate = DeployGate::Automatic;
        config.work_dir = dir.path().to_path_buf();
        config.registry.image_prefix = "registry.example.com/acme/app".to_string();
        let request = TriggerRequest {
            branch: "feature/x".to_string(),
            commit_sha: None,
        };
        let err = run_release(config, request, false).await.unwrap_err();
        assert!(err.to_string().contains("feature/x"));
    }
}
