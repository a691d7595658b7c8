//! Release pipeline
//!
//! Drives a run through build → publish → [approval] → rollout:
//! - one build job per component, run concurrently and joined before the gate
//! - manual or automatic deploy gate
//! - rollouts serialized by a process-wide deploy lock
//! - cancellation until the rollout starts

pub mod build;
pub mod context;
pub mod rollout;

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{OrchestrationDescriptor, PipelineConfig};
use crate::domain::pipeline::{DeployGate, JobRecord, PipelineRun, PipelineState, TriggerRequest};
use crate::error::PipelineError;
use crate::infra::CommandExecutor;
use crate::state::{LogHub, RunStore};

pub use context::RunContext;

/// How a run left the pipeline
enum Outcome {
    Done,
    Failed(String),
    Cancelled,
}

enum GateDecision {
    Approved,
    Cancelled,
    TimedOut,
}

pub struct ReleasePipeline {
    config: PipelineConfig,
    descriptor: OrchestrationDescriptor,
    executor: Arc<dyn CommandExecutor>,
    runs: Arc<RunStore>,
    logs: Arc<LogHub>,
    /// Held for the whole rollout
    deploy_lock: Mutex<()>,
    /// run_id -> approval signal, present while the run waits
    approvals: RwLock<HashMap<String, oneshot::Sender<()>>>,
    cancel_tokens: RwLock<HashMap<String, CancellationToken>>,
}

impl ReleasePipeline {
    pub fn new(
        config: PipelineConfig,
        descriptor: OrchestrationDescriptor,
        executor: Arc<dyn CommandExecutor>,
        runs: Arc<RunStore>,
        logs: Arc<LogHub>,
    ) -> Self {
        Self {
            config,
            descriptor,
            executor,
            runs,
            logs,
            deploy_lock: Mutex::new(()),
            approvals: RwLock::new(HashMap::new()),
            cancel_tokens: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn descriptor(&self) -> &OrchestrationDescriptor {
        &self.descriptor
    }

    pub fn runs(&self) -> &Arc<RunStore> {
        &self.runs
    }

    pub fn logs(&self) -> &Arc<LogHub> {
        &self.logs
    }

    /// Validate a trigger and register the run without starting it
    pub async fn prepare(&self, request: TriggerRequest) -> Result<PipelineRun, PipelineError> {
        if request.branch != self.config.main_branch {
            info!(
                branch = %request.branch,
                main_branch = %self.config.main_branch,
                "Ignoring trigger for non-release branch"
            );
            return Err(PipelineError::BranchNotEligible {
                branch: request.branch,
                main_branch: self.config.main_branch.clone(),
            });
        }

        if self.runs.is_at_capacity().await {
            return Err(PipelineError::AtCapacity(self.runs.max_active()));
        }

        let jobs = self
            .descriptor
            .services()
            .iter()
            .map(|s| JobRecord::new(s.name.clone(), s.image.clone()))
            .collect();

        let run = PipelineRun::new(
            uuid::Uuid::new_v4().to_string(),
            request.branch,
            request.commit_sha,
            self.config.main_branch.clone(),
            self.config.gate,
            jobs,
        );

        self.logs.create(&run.id).await;
        self.cancel_tokens
            .write()
            .await
            .insert(run.id.clone(), CancellationToken::new());
        self.runs.create(run.clone()).await;

        info!(
            run_id = %run.id,
            branch = %run.branch,
            commit = ?run.commit_sha,
            gate = ?run.gate,
            "Pipeline run created"
        );
        Ok(run)
    }

    /// Register a run and drive it in the background
    pub async fn trigger(self: &Arc<Self>, request: TriggerRequest) -> Result<PipelineRun, PipelineError> {
        let run = self.prepare(request).await?;
        let pipeline = self.clone();
        let run_id = run.id.clone();
        tokio::spawn(async move {
            if let Err(e) = pipeline.run(&run_id).await {
                error!(run_id = %run_id, error = %e, "Pipeline run aborted");
            }
        });
        Ok(run)
    }

    /// Drive a prepared run to a terminal state
    pub async fn run(&self, run_id: &str) -> Result<PipelineState, PipelineError> {
        let cancel = self
            .cancel_tokens
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| PipelineError::RunNotFound(run_id.to_string()))?;

        let ctx = RunContext::new(
            run_id.to_string(),
            self.runs.clone(),
            self.executor.clone(),
            self.logs.sink(run_id).await,
            cancel,
            self.config.work_dir.clone(),
            self.config.step_timeout,
        );

        let outcome = self.drive(&ctx).await;
        self.finish(&ctx, outcome).await
    }

    async fn drive(&self, ctx: &RunContext) -> Outcome {
        // Cancellation is checked under the store lock at every transition
        let started = ctx
            .update(|run| {
                if ctx.is_cancelled() {
                    return Ok(false);
                }
                run.advance(PipelineState::Building).map(|_| true)
            })
            .await;
        match started {
            Some(Ok(true)) => {}
            Some(Ok(false)) => return Outcome::Cancelled,
            Some(Err(e)) => return Outcome::Failed(e.to_string()),
            None => return Outcome::Failed("run disappeared from the store".to_string()),
        }

        // Build phase: all jobs concurrently, then the join barrier
        let handles: Vec<_> = self
            .descriptor
            .services()
            .iter()
            .cloned()
            .map(|service| {
                tokio::spawn(build::execute(
                    ctx.clone(),
                    service,
                    self.config.registry.clone(),
                ))
            })
            .collect();
        let results = futures::future::join_all(handles).await;
        let all_published = results.iter().all(|r| matches!(r, Ok(true)));

        if ctx.is_cancelled() {
            return Outcome::Cancelled;
        }
        if !all_published {
            let failed = ctx
                .update(|run| run.failed_jobs().join(", "))
                .await
                .unwrap_or_default();
            return Outcome::Failed(format!("build failed for: {}", failed));
        }

        // Gate
        if self.config.gate == DeployGate::Manual {
            match self.await_approval(ctx).await {
                Ok(GateDecision::Approved) => {
                    ctx.log("Rollout approved");
                }
                Ok(GateDecision::Cancelled) => return Outcome::Cancelled,
                Ok(GateDecision::TimedOut) => {
                    return Outcome::Failed(format!(
                        "approval timed out after {}s",
                        self.config.approval_timeout.as_secs()
                    ))
                }
                Err(reason) => return Outcome::Failed(reason),
            }
        }

        // One rollout at a time; a run waiting for the lock can still be cancelled
        let _guard = tokio::select! {
            guard = self.deploy_lock.lock() => guard,
            _ = ctx.cancel_token().cancelled() => return Outcome::Cancelled,
        };

        let deploying = ctx
            .update(|run| {
                if ctx.is_cancelled() {
                    return Ok(false);
                }
                if let Err(e) = run.advance(PipelineState::Deploying) {
                    return Err(e);
                }
                run.rollout = rollout::stages();
                Ok(true)
            })
            .await;
        match deploying {
            Some(Ok(true)) => {}
            Some(Ok(false)) => return Outcome::Cancelled,
            Some(Err(e)) => return Outcome::Failed(e.to_string()),
            None => return Outcome::Failed("run disappeared from the store".to_string()),
        }
        info!(run_id = %ctx.run_id, "Rollout started");

        match rollout::execute(ctx, &self.config, &self.descriptor).await {
            Ok(()) => Outcome::Done,
            Err(reason) => Outcome::Failed(format!("rollout failed: {}", reason)),
        }
    }

    async fn await_approval(&self, ctx: &RunContext) -> Result<GateDecision, String> {
        let (tx, rx) = oneshot::channel();
        // register before the state flips so approve() always finds the sender
        self.approvals
            .write()
            .await
            .insert(ctx.run_id.clone(), tx);

        let waiting = ctx
            .update(|run| {
                if ctx.is_cancelled() {
                    return Ok(false);
                }
                run.advance(PipelineState::AwaitingApproval).map(|_| true)
            })
            .await;
        match waiting {
            Some(Ok(true)) => {}
            Some(Ok(false)) => return Ok(GateDecision::Cancelled),
            Some(Err(e)) => return Err(e.to_string()),
            None => return Err("run disappeared from the store".to_string()),
        }

        ctx.log(format!(
            "Waiting for manual approval (POST /runs/{}/approve)",
            ctx.run_id
        ));
        info!(run_id = %ctx.run_id, "Awaiting approval");

        let decision = tokio::select! {
            res = rx => match res {
                Ok(()) => Ok(GateDecision::Approved),
                Err(_) => Err("approval channel closed".to_string()),
            },
            _ = ctx.cancel_token().cancelled() => Ok(GateDecision::Cancelled),
            _ = tokio::time::sleep(self.config.approval_timeout) => Ok(GateDecision::TimedOut),
        };

        self.approvals.write().await.remove(&ctx.run_id);
        decision
    }

    async fn finish(&self, ctx: &RunContext, outcome: Outcome) -> Result<PipelineState, PipelineError> {
        let final_state = ctx
            .update(|run| {
                let result = match outcome {
                    Outcome::Done => run.advance(PipelineState::Done),
                    Outcome::Failed(ref reason) => run.fail(reason.clone()),
                    Outcome::Cancelled => run.advance(PipelineState::Cancelled),
                };
                if let Err(e) = result {
                    warn!(run_id = %run.id, error = %e, "Could not record run outcome");
                }
                (run.state, run.error.clone(), run.rollout.clone())
            })
            .await;

        let Some((state, reason, stages)) = final_state else {
            return Err(PipelineError::RunNotFound(ctx.run_id.clone()));
        };

        if !stages.is_empty() {
            ctx.log("");
            ctx.log("=== Stage Summary ===");
            for line in rollout::summary(&stages) {
                ctx.log(line);
            }
        }

        match state {
            PipelineState::Done => {
                ctx.log("=== Release Complete ===");
                info!(run_id = %ctx.run_id, "Pipeline run finished");
            }
            PipelineState::Cancelled => {
                ctx.log_stderr("Run cancelled");
                warn!(run_id = %ctx.run_id, "Pipeline run cancelled");
            }
            _ => {
                let reason = reason.unwrap_or_default();
                ctx.log_stderr(format!("Run failed: {}", reason));
                error!(run_id = %ctx.run_id, state = state.as_str(), error = %reason, "Pipeline run failed");
            }
        }

        self.runs.archive(&ctx.run_id).await;
        self.logs.finish(&ctx.run_id).await;
        self.cancel_tokens.write().await.remove(&ctx.run_id);
        self.approvals.write().await.remove(&ctx.run_id);

        Ok(state)
    }

    /// Release a run waiting at the manual gate
    pub async fn approve(&self, run_id: &str) -> Result<PipelineRun, PipelineError> {
        let run = self
            .runs
            .get_any(run_id)
            .await
            .ok_or_else(|| PipelineError::RunNotFound(run_id.to_string()))?;

        if run.state != PipelineState::AwaitingApproval {
            return Err(PipelineError::NotAwaitingApproval {
                run_id: run_id.to_string(),
                state: run.state,
            });
        }

        let sender = self.approvals.write().await.remove(run_id);
        match sender.map(|tx| tx.send(())) {
            Some(Ok(())) => {
                info!(run_id = %run_id, "Run approved");
                Ok(run)
            }
            _ => Err(PipelineError::NotAwaitingApproval {
                run_id: run_id.to_string(),
                state: run.state,
            }),
        }
    }

    /// Cancel a run that has not started its rollout
    pub async fn cancel(&self, run_id: &str) -> Result<PipelineRun, PipelineError> {
        let token = self.cancel_tokens.read().await.get(run_id).cloned();

        let checked = self
            .runs
            .update(run_id, |run| {
                if run.state.is_terminal() {
                    return Err(PipelineError::AlreadyFinished(run_id.to_string()));
                }
                if !run.state.is_cancellable() {
                    return Err(PipelineError::RolloutInProgress(run_id.to_string()));
                }
                // fired under the store lock, so the run cannot slip into Deploying
                if let Some(ref token) = token {
                    token.cancel();
                }
                Ok(run.clone())
            })
            .await;

        match checked {
            Some(result) => {
                let run = result?;
                info!(run_id = %run_id, state = run.state.as_str(), "Run cancellation requested");
                Ok(run)
            }
            None => match self.runs.get_any(run_id).await {
                Some(_) => Err(PipelineError::AlreadyFinished(run_id.to_string())),
                None => Err(PipelineError::RunNotFound(run_id.to_string())),
            },
        }
    }

    /// Drop expired history and finished log channels
    pub async fn cleanup(&self, max_age_hours: i64) {
        self.runs.cleanup_stale().await;
        self.logs.cleanup_expired(max_age_hours).await;
    }
}
