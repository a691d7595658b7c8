//! Release pipeline domain model
//!
//! Run-level state machine, per-component jobs, stage records and log lines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::image::ImageReference;

/// Run-level pipeline state
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Building,
    Pushing,
    AwaitingApproval,
    Deploying,
    Done,
    Failed,
    Cancelled,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Building => "building",
            PipelineState::Pushing => "pushing",
            PipelineState::AwaitingApproval => "awaiting_approval",
            PipelineState::Deploying => "deploying",
            PipelineState::Done => "done",
            PipelineState::Failed => "failed",
            PipelineState::Cancelled => "cancelled",
        }
    }

    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Done | PipelineState::Failed | PipelineState::Cancelled
        )
    }

    /// Cancellation is only honoured before the rollout starts
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            PipelineState::Idle
                | PipelineState::Building
                | PipelineState::Pushing
                | PipelineState::AwaitingApproval
        )
    }

    pub fn can_transition(&self, to: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, to),
            (Idle, Building)
                | (Building, Pushing)
                | (Pushing, AwaitingApproval)
                | (Pushing, Deploying)
                | (AwaitingApproval, Deploying)
                | (Deploying, Done)
                | (Building, Failed)
                | (Pushing, Failed)
                | (Deploying, Failed)
                // an unanswered approval times out
                | (AwaitingApproval, Failed)
        ) || (to == Cancelled && self.is_cancellable())
    }
}

/// Per-component build job state
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Building,
    Pushing,
    Published,
    Failed,
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Published | JobState::Failed)
    }
}

/// How the rollout is released once images are published
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeployGate {
    /// Wait for an operator to approve the run
    Manual,
    /// Roll out as soon as every image is published
    Automatic,
}

impl DeployGate {
    pub fn from_str(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "auto" | "automatic" => DeployGate::Automatic,
            _ => DeployGate::Manual,
        }
    }
}

/// Stage status
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

/// One step of a job or of the rollout
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Stage {
    /// Identifier (e.g. "docker_build", "compose_up")
    pub name: String,
    /// Display name (e.g. "Docker Build")
    pub display_name: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub status: StageStatus,
    pub message: Option<String>,
}

impl Stage {
    pub fn new(name: &str, display_name: &str) -> Self {
        Self {
            name: name.to_string(),
            display_name: display_name.to_string(),
            started_at: None,
            finished_at: None,
            duration_ms: None,
            status: StageStatus::Pending,
            message: None,
        }
    }

    pub fn start(&mut self) {
        self.started_at = Some(Utc::now());
        self.status = StageStatus::Running;
    }

    pub fn finish(&mut self, success: bool, message: Option<String>) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.status = if success {
            StageStatus::Success
        } else {
            StageStatus::Failed
        };
        self.message = message;
        if let Some(started) = self.started_at {
            self.duration_ms = Some((now - started).num_milliseconds());
        }
    }

    pub fn skip(&mut self, reason: Option<String>) {
        self.status = StageStatus::Skipped;
        self.message = reason;
    }
}

/// Build-and-publish job of one component
#[derive(Clone, Debug, Serialize)]
pub struct JobRecord {
    pub component: String,
    pub image: ImageReference,
    pub state: JobState,
    pub stages: Vec<Stage>,
}

impl JobRecord {
    pub fn new(component: impl Into<String>, image: ImageReference) -> Self {
        Self {
            component: component.into(),
            image,
            state: JobState::Pending,
            stages: vec![
                Stage::new("registry_login", "Registry Login"),
                Stage::new("docker_build", "Docker Build"),
                Stage::new("docker_push", "Docker Push"),
            ],
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum TransitionError {
    #[error("illegal pipeline transition {from:?} -> {to:?}")]
    Illegal {
        from: PipelineState,
        to: PipelineState,
    },

    #[error("branch '{branch}' may not deploy (only '{main_branch}' deploys)")]
    NotMainBranch { branch: String, main_branch: String },
}

/// A pipeline run
#[derive(Clone, Debug, Serialize)]
pub struct PipelineRun {
    pub id: String,
    pub branch: String,
    pub commit_sha: Option<String>,
    /// Branch allowed to reach `Deploying`
    pub main_branch: String,
    pub gate: DeployGate,
    pub state: PipelineState,
    pub jobs: Vec<JobRecord>,
    /// Rollout stages, populated once the run starts deploying
    pub rollout: Vec<Stage>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineRun {
    pub fn new(
        id: String,
        branch: String,
        commit_sha: Option<String>,
        main_branch: String,
        gate: DeployGate,
        jobs: Vec<JobRecord>,
    ) -> Self {
        Self {
            id,
            branch,
            commit_sha,
            main_branch,
            gate,
            state: PipelineState::Idle,
            jobs,
            rollout: Vec::new(),
            created_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    pub fn is_main_branch(&self) -> bool {
        self.branch == self.main_branch
    }

    /// Move the run to `to`, enforcing the state machine and the branch gate
    pub fn advance(&mut self, to: PipelineState) -> Result<(), TransitionError> {
        if !self.state.can_transition(to) {
            return Err(TransitionError::Illegal {
                from: self.state,
                to,
            });
        }
        if to == PipelineState::Deploying && !self.is_main_branch() {
            return Err(TransitionError::NotMainBranch {
                branch: self.branch.clone(),
                main_branch: self.main_branch.clone(),
            });
        }
        self.state = to;
        if to.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Record failure with a reason
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.advance(PipelineState::Failed)?;
        self.error = Some(reason.into());
        Ok(())
    }

    pub fn job_mut(&mut self, component: &str) -> Option<&mut JobRecord> {
        self.jobs.iter_mut().find(|j| j.component == component)
    }

    /// Run-level state implied by the job states while the build phase runs
    ///
    /// `Building` while any job is pending or building, `Pushing` once every
    /// live job has reached the push step or beyond.
    pub fn build_phase_state(&self) -> PipelineState {
        let building = self
            .jobs
            .iter()
            .any(|j| matches!(j.state, JobState::Pending | JobState::Building));
        if building {
            PipelineState::Building
        } else {
            PipelineState::Pushing
        }
    }

    pub fn all_jobs_published(&self) -> bool {
        self.jobs.iter().all(|j| j.state == JobState::Published)
    }

    pub fn failed_jobs(&self) -> Vec<&str> {
        self.jobs
            .iter()
            .filter(|j| j.state == JobState::Failed)
            .map(|j| j.component.as_str())
            .collect()
    }
}

/// Trigger for a pipeline run (push webhook or CLI)
#[derive(Debug, Clone, Deserialize)]
pub struct TriggerRequest {
    pub branch: String,
    #[serde(default)]
    pub commit_sha: Option<String>,
}

/// Log line
#[derive(Clone, Debug, Serialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: String, // stdout | stderr
    pub content: String,
}

impl LogLine {
    pub fn new(stream: &str, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream: stream.to_string(),
            content: content.into(),
        }
    }

    pub fn stdout(content: impl Into<String>) -> Self {
        Self::new("stdout", content)
    }

    pub fn stderr(content: impl Into<String>) -> Self {
        Self::new("stderr", content)
    }
}
