//! Run context
//!
//! Everything a running job or rollout needs: the run id, the run store, the
//! command executor, the log sink and the cancellation token.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::domain::pipeline::{JobState, LogLine, PipelineRun, PipelineState, Stage};
use crate::infra::{CommandExecutor, CommandSpec, LogSink};
use crate::state::RunStore;

/// Which stage list a stage lives in
#[derive(Clone, Copy, Debug)]
pub enum StageOwner<'a> {
    Job(&'a str),
    Rollout,
}

fn stage_mut<'r>(run: &'r mut PipelineRun, owner: StageOwner<'_>, name: &str) -> Option<&'r mut Stage> {
    let stages = match owner {
        StageOwner::Job(component) => &mut run.job_mut(component)?.stages,
        StageOwner::Rollout => &mut run.rollout,
    };
    stages.iter_mut().find(|s| s.name == name)
}

#[derive(Clone)]
pub struct RunContext {
    pub run_id: String,
    runs: Arc<RunStore>,
    executor: Arc<dyn CommandExecutor>,
    sink: LogSink,
    cancel: CancellationToken,
    work_dir: PathBuf,
    step_timeout: Duration,
}

impl RunContext {
    pub fn new(
        run_id: String,
        runs: Arc<RunStore>,
        executor: Arc<dyn CommandExecutor>,
        sink: LogSink,
        cancel: CancellationToken,
        work_dir: PathBuf,
        step_timeout: Duration,
    ) -> Self {
        Self {
            run_id,
            runs,
            executor,
            sink,
            cancel,
            work_dir,
            step_timeout,
        }
    }

    pub fn log(&self, content: impl Into<String>) {
        (self.sink)(LogLine::stdout(content));
    }

    pub fn log_stderr(&self, content: impl Into<String>) {
        (self.sink)(LogLine::stderr(content));
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn executor(&self) -> &dyn CommandExecutor {
        self.executor.as_ref()
    }

    /// Same run, but commands ignore cancellation (rollout steps)
    pub fn uninterruptible(&self) -> Self {
        Self {
            cancel: CancellationToken::new(),
            ..self.clone()
        }
    }

    pub async fn update<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&mut PipelineRun) -> R,
    {
        self.runs.update(&self.run_id, f).await
    }

    /// Set a job state and promote the run to `Pushing` once every job got there
    pub async fn set_job_state(&self, component: &str, state: JobState) {
        self.update(|run| {
            if let Some(job) = run.job_mut(component) {
                job.state = state;
            }
            if run.state == PipelineState::Building
                && run.failed_jobs().is_empty()
                && run.build_phase_state() == PipelineState::Pushing
            {
                let _ = run.advance(PipelineState::Pushing);
            }
        })
        .await;
    }

    async fn with_stage<F>(&self, owner: StageOwner<'_>, name: &str, f: F)
    where
        F: FnOnce(&mut Stage),
    {
        self.update(|run| {
            if let Some(stage) = stage_mut(run, owner, name) {
                f(stage);
            }
        })
        .await;
    }

    pub async fn skip_stage(&self, owner: StageOwner<'_>, name: &str, reason: &str) {
        self.log(format!("Skipping {} ({})", name, reason));
        self.with_stage(owner, name, |s| s.skip(Some(reason.to_string())))
            .await;
    }

    /// Run one command as a recorded stage; any failure is returned as a message
    pub async fn run_stage(
        &self,
        owner: StageOwner<'_>,
        name: &str,
        spec: CommandSpec,
    ) -> Result<(), String> {
        self.with_stage(owner, name, Stage::start).await;
        let result = self.exec(spec).await;
        let message = result.as_ref().err().cloned();
        self.with_stage(owner, name, |s| s.finish(message.is_none(), message))
            .await;
        result
    }

    /// Execute in the work dir with the step timeout
    pub async fn exec(&self, spec: CommandSpec) -> Result<(), String> {
        let spec = spec.work_dir(&self.work_dir).timeout(self.step_timeout);
        self.log(format!(">>> {}", spec.command_line()));

        match self
            .executor
            .execute(&spec, self.sink.clone(), self.cancel.clone())
            .await
        {
            Ok(outcome) if outcome.success() => Ok(()),
            Ok(outcome) if outcome.timed_out => {
                let msg = format!(
                    "'{}' timed out after {}s",
                    spec.program,
                    self.step_timeout.as_secs()
                );
                self.log_stderr(&msg);
                Err(msg)
            }
            Ok(outcome) => {
                let msg = format!(
                    "'{}' exited with code {}",
                    spec.command_line(),
                    outcome.exit_code.unwrap_or(-1)
                );
                self.log_stderr(&msg);
                Err(msg)
            }
            Err(e) => {
                let msg = e.to_string();
                self.log_stderr(format!("Error: {}", msg));
                Err(msg)
            }
        }
    }
}
