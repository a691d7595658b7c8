//! Command execution
//!
//! Runs external programs (`docker`, `docker compose`) for the release
//! pipeline with:
//! - live stdout/stderr streaming into a log sink
//! - a bounded timeout
//! - cancellation
//! - optional stdin (for `docker login --password-stdin`)
//!
//! The pipeline talks to the [`CommandExecutor`] trait so tests can script
//! command outcomes without a docker daemon.

use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::domain::pipeline::LogLine;

/// Receives every output line of a running command
pub type LogSink = Arc<dyn Fn(LogLine) + Send + Sync>;

/// Sink that drops everything
pub fn discard_sink() -> LogSink {
    Arc::new(|_| {})
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write stdin: {0}")]
    Stdin(#[source] std::io::Error),

    #[error("failed to wait for command: {0}")]
    WaitFailed(#[source] std::io::Error),

    #[error("command was cancelled")]
    Cancelled,
}

/// A command to run
#[derive(Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub work_dir: Option<PathBuf>,
    /// Written to the child's stdin, never logged
    pub stdin: Option<String>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            work_dir: None,
            stdin: None,
            timeout: Duration::from_secs(crate::config::env::constants::DEFAULT_STEP_TIMEOUT_SECS),
        }
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `program arg1 arg2 ...`
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// Debug must not leak stdin (registry password)
impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("command", &self.command_line())
            .field("work_dir", &self.work_dir)
            .field("stdin", &self.stdin.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Result of a finished (or timed out) command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandOutcome {
    /// `None` when killed by a signal or timed out
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl CommandOutcome {
    pub fn exited(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            timed_out: false,
        }
    }

    pub fn timed_out() -> Self {
        Self {
            exit_code: None,
            timed_out: true,
        }
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(
        &self,
        spec: &CommandSpec,
        log: LogSink,
        cancel: CancellationToken,
    ) -> Result<CommandOutcome, CommandError>;
}

/// Executes commands as child processes
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandRunner;

impl CommandRunner {
    /// Run a command, streaming both output streams line by line into `log`
    pub async fn run_with_streaming(
        spec: &CommandSpec,
        log: LogSink,
        cancel: CancellationToken,
    ) -> Result<CommandOutcome, CommandError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = spec.work_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| CommandError::SpawnFailed {
            program: spec.program.clone(),
            source,
        })?;

        if let Some(ref input) = spec.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(input.as_bytes())
                    .await
                    .map_err(CommandError::Stdin)?;
                // closing stdin signals EOF to the child
                drop(stdin);
            }
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stdout_log = log.clone();
        let stdout_task = tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    stdout_log(LogLine::stdout(line));
                }
            }
        });

        let stderr_log = log.clone();
        let stderr_task = tokio::spawn(async move {
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    stderr_log(LogLine::stderr(line));
                }
            }
        });

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                warn!(command = %spec.program, "Command cancelled, killing process");
                let _ = child.kill().await;
                Err(CommandError::Cancelled)
            }
            _ = tokio::time::sleep(spec.timeout) => {
                error!(command = %spec.program, timeout = ?spec.timeout, "Command timed out");
                let _ = child.kill().await;
                // reap the process
                let _ = child.wait().await;
                Ok(CommandOutcome::timed_out())
            }
            status = child.wait() => {
                let status = status.map_err(CommandError::WaitFailed)?;
                Ok(CommandOutcome { exit_code: status.code(), timed_out: false })
            }
        };

        let _ = stdout_task.await;
        let _ = stderr_task.await;

        result
    }
}

#[async_trait]
impl CommandExecutor for CommandRunner {
    async fn execute(
        &self,
        spec: &CommandSpec,
        log: LogSink,
        cancel: CancellationToken,
    ) -> Result<CommandOutcome, CommandError> {
        Self::run_with_streaming(spec, log, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn collecting_sink() -> (LogSink, Arc<Mutex<Vec<LogLine>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let captured = lines.clone();
        let sink: LogSink = Arc::new(move |line| captured.lock().unwrap().push(line));
        (sink, lines)
    }

    #[tokio::test]
    async fn test_streams_stdout_and_exit_code() {
        let (sink, lines) = collecting_sink();
        let spec = CommandSpec::new("sh", ["-c", "echo hello; echo oops >&2; exit 3"])
            .work_dir("/tmp")
            .timeout(Duration::from_secs(5));

        let outcome = CommandRunner::run_with_streaming(&spec, sink, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.success());
        let lines = lines.lock().unwrap();
        assert!(lines.iter().any(|l| l.stream == "stdout" && l.content == "hello"));
        assert!(lines.iter().any(|l| l.stream == "stderr" && l.content == "oops"));
    }

    #[tokio::test]
    async fn test_stdin_is_forwarded() {
        let (sink, lines) = collecting_sink();
        let spec = CommandSpec::new("cat", Vec::<String>::new())
            .stdin("s3cret")
            .timeout(Duration::from_secs(5));

        let outcome = CommandRunner::run_with_streaming(&spec, sink, CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.success());
        assert_eq!(lines.lock().unwrap()[0].content, "s3cret");
        assert!(!format!("{:?}", spec).contains("s3cret"));
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let spec = CommandSpec::new("sleep", ["10"]).timeout(Duration::from_millis(100));
        let outcome = CommandRunner::run_with_streaming(&spec, discard_sink(), CancellationToken::new())
            .await
            .unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.success());
    }

    #[tokio::test]
    async fn test_cancellation() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let spec = CommandSpec::new("sleep", ["10"]).timeout(Duration::from_secs(5));
        let result = CommandRunner::run_with_streaming(&spec, discard_sink(), cancel).await;
        assert!(matches!(result, Err(CommandError::Cancelled)));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let spec = CommandSpec::new("nonexistent_command_12345", Vec::<String>::new());
        let result = CommandRunner::run_with_streaming(&spec, discard_sink(), CancellationToken::new()).await;
        assert!(matches!(result, Err(CommandError::SpawnFailed { .. })));
    }

    #[test]
    fn test_command_line() {
        let spec = CommandSpec::new("docker", ["push", "app/backend:latest"]);
        assert_eq!(spec.command_line(), "docker push app/backend:latest");
    }
}
