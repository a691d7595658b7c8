//! Rollout on the target host
//!
//! registry login, compose pull, compose up with forced recreation, image
//! prune. Every step is fatal; nothing is rolled back. When no compose file
//! exists yet, the descriptor the images were built from is written first.

use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{OrchestrationDescriptor, PipelineConfig};
use crate::domain::pipeline::{Stage, StageStatus};
use crate::infra::{discard_sink, CommandExecutor, CommandSpec};

use super::build::login_command;
use super::context::{RunContext, StageOwner};

/// Compose CLI flavour found on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeCommand {
    program: String,
    base_args: Vec<String>,
}

impl ComposeCommand {
    /// Standalone `docker-compose` if it runs, otherwise the `docker compose` plugin
    pub async fn detect(executor: &dyn CommandExecutor) -> Self {
        let probe = CommandSpec::new("docker-compose", ["version"]).timeout(Duration::from_secs(10));
        let standalone = executor
            .execute(&probe, discard_sink(), CancellationToken::new())
            .await
            .map(|o| o.success())
            .unwrap_or(false);

        if standalone {
            Self::standalone()
        } else {
            Self::plugin()
        }
    }

    pub fn standalone() -> Self {
        Self {
            program: "docker-compose".to_string(),
            base_args: Vec::new(),
        }
    }

    pub fn plugin() -> Self {
        Self {
            program: "docker".to_string(),
            base_args: vec!["compose".to_string()],
        }
    }

    pub fn spec(&self, compose_file: &Path, args: &[&str]) -> CommandSpec {
        let mut all = self.base_args.clone();
        all.push("-f".to_string());
        all.push(compose_file.display().to_string());
        all.extend(args.iter().map(|a| a.to_string()));
        CommandSpec::new(&self.program, all)
    }
}

pub fn stages() -> Vec<Stage> {
    vec![
        Stage::new("registry_login", "Registry Login"),
        Stage::new("compose_pull", "Compose Pull"),
        Stage::new("compose_up", "Compose Up"),
        Stage::new("image_prune", "Image Prune"),
    ]
}

fn prune_command() -> CommandSpec {
    CommandSpec::new("docker", ["image", "prune", "-f"])
}

/// Write `descriptor` to `path` unless a file is already there
///
/// Returns whether the file was written.
pub async fn ensure_compose_file(path: &Path, descriptor: &OrchestrationDescriptor) -> Result<bool, String> {
    let exists = tokio::fs::try_exists(path)
        .await
        .map_err(|e| format!("cannot stat {}: {}", path.display(), e))?;
    if exists {
        return Ok(false);
    }

    let yaml = descriptor.to_yaml().map_err(|e| e.to_string())?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| format!("cannot create {}: {}", parent.display(), e))?;
    }
    tokio::fs::write(path, yaml)
        .await
        .map_err(|e| format!("cannot write {}: {}", path.display(), e))?;
    Ok(true)
}

/// Run every rollout step in order, stopping at the first failure
pub async fn execute(
    ctx: &RunContext,
    config: &PipelineConfig,
    descriptor: &OrchestrationDescriptor,
) -> Result<(), String> {
    let ctx = ctx.uninterruptible();
    let owner = StageOwner::Rollout;
    let compose_path = config.compose_path();
    let compose = ComposeCommand::detect(ctx.executor()).await;

    ctx.log("=== Rollout ===");
    ctx.log(format!("Compose file: {}", compose_path.display()));
    ctx.log(format!("Timestamp: {}", chrono::Utc::now().to_rfc3339()));

    match ensure_compose_file(&compose_path, descriptor).await {
        Ok(true) => {
            ctx.log("Compose file missing, wrote the built service layout");
            tracing::info!(run_id = %ctx.run_id, path = %compose_path.display(), "Compose file written");
        }
        Ok(false) => {}
        Err(e) => {
            ctx.log_stderr(format!("Error: {}", e));
            return Err(e);
        }
    }

    match config.registry.credentials {
        Some(ref creds) => {
            ctx.log("[1/4] Logging in to registry...");
            ctx.run_stage(owner, "registry_login", login_command(&config.registry, creds))
                .await?
        }
        None => {
            ctx.skip_stage(owner, "registry_login", "no registry credentials")
                .await
        }
    }

    ctx.log("[2/4] Pulling images...");
    ctx.run_stage(owner, "compose_pull", compose.spec(&compose_path, &["pull"]))
        .await?;

    ctx.log("[3/4] Recreating containers...");
    ctx.run_stage(
        owner,
        "compose_up",
        compose.spec(&compose_path, &["up", "-d", "--force-recreate"]),
    )
    .await?;

    ctx.log("[4/4] Pruning unused images...");
    ctx.run_stage(owner, "image_prune", prune_command()).await?;

    Ok(())
}

/// One summary line per stage for the run log
pub fn summary(stages: &[Stage]) -> Vec<String> {
    stages
        .iter()
        .map(|stage| {
            let duration = stage
                .duration_ms
                .map(|d| format!("{}ms", d))
                .unwrap_or_else(|| "-".to_string());
            let icon = match stage.status {
                StageStatus::Success => "✓",
                StageStatus::Failed => "✗",
                StageStatus::Skipped => "⊘",
                StageStatus::Running => "⟳",
                StageStatus::Pending => "○",
            };
            format!("{} {} ({})", icon, stage.display_name, duration)
        })
        .collect()
}
