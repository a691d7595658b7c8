//! Agent application state

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::config::{AgentConfig, DescriptorError, OrchestrationDescriptor};
use crate::infra::{CommandExecutor, CommandRunner};
use crate::pipeline::ReleasePipeline;

use super::log_hub::LogHub;
use super::run_store::RunStore;

/// State shared by the control API handlers
pub struct AppState {
    /// Key expected in `x-api-key`
    pub api_key: String,
    pub config: AgentConfig,
    pub started_at: DateTime<Utc>,
    pub pipeline: Arc<ReleasePipeline>,
}

impl AppState {
    /// Load the descriptor and wire the pipeline to real child processes
    pub fn new(config: AgentConfig) -> Result<Self, DescriptorError> {
        let descriptor = OrchestrationDescriptor::load_or_standard(
            &config.pipeline.compose_path(),
            &config.pipeline.registry.image_prefix,
        )?;

        tracing::info!(
            api_key_len = config.api_key.len(),
            port = config.port,
            main_branch = %config.pipeline.main_branch,
            gate = ?config.pipeline.gate,
            services = descriptor.services().len(),
            "Loaded configuration"
        );

        Ok(Self::with_executor(config, descriptor, Arc::new(CommandRunner)))
    }

    pub fn with_executor(
        config: AgentConfig,
        descriptor: OrchestrationDescriptor,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        let pipeline = ReleasePipeline::new(
            config.pipeline.clone(),
            descriptor,
            executor,
            Arc::new(RunStore::new()),
            Arc::new(LogHub::new()),
        );

        Self {
            api_key: config.api_key.clone(),
            config,
            started_at: Utc::now(),
            pipeline: Arc::new(pipeline),
        }
    }

    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}
