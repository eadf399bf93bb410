use std::panic::AssertUnwindSafe;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::callable::{Callable, CallableRegistry, CallableResult};
use crate::task::{Metadata, TaskDefinition, TaskOutput, UnitOfWork, human_duration};

/// Why a single attempt did not succeed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("command exited with status {0}")]
    NonZeroExit(i32),
    #[error("command terminated by signal")]
    Terminated,
    #[error("failed to run command: {0}")]
    Spawn(String),
    #[error("callable '{0}' is not registered")]
    UnknownCallable(String),
    #[error("callable failed: {0}")]
    Callable(String),
    #[error("timed out after {}", human_duration(*.0))]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl ExecutionError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ExecutionError::Cancelled)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub exit_code: Option<i32>,
    pub return_value: Option<serde_json::Value>,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<ExecutionError>,
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    pub fn failure(error: ExecutionError) -> Self {
        Self {
            stderr: error.to_string(),
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn output(&self) -> TaskOutput {
        TaskOutput {
            exit_code: self.exit_code,
            return_value: self.return_value.clone(),
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
        }
    }
}

/// Performs one attempt of a task's unit of work.
///
/// Implementations must give up promptly once `cancel` fires, reporting
/// [`ExecutionError::Cancelled`], and must report
/// [`ExecutionError::Timeout`] once `timeout` elapses.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        task: &TaskDefinition,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> ExecutionResult;
}

/// Runs shell commands as child processes and callables from a
/// [`CallableRegistry`].
#[derive(Clone, Default)]
pub struct ProcessExecutor {
    callables: Arc<CallableRegistry>,
}

impl ProcessExecutor {
    pub fn new(callables: Arc<CallableRegistry>) -> Self {
        Self { callables }
    }

    pub fn callables(&self) -> &CallableRegistry {
        &self.callables
    }

    async fn run_callable(&self, name: &str, metadata: Metadata) -> ExecutionResult {
        let Some(callable) = self.callables.get(name) else {
            return ExecutionResult::failure(ExecutionError::UnknownCallable(name.to_string()));
        };

        let outcome: CallableResult = match callable {
            Callable::Blocking(f) => tokio::task::spawn_blocking(move || f(metadata))
                .await
                .unwrap_or_else(|e| Err(format!("callable panicked: {}", e).into())),
            Callable::Async(f) => AssertUnwindSafe(f(metadata))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err("callable panicked".into())),
        };

        match outcome {
            Ok(value) => ExecutionResult {
                stdout: value.to_string(),
                return_value: Some(value),
                ..ExecutionResult::success("")
            },
            Err(e) => ExecutionResult {
                exit_code: Some(1),
                ..ExecutionResult::failure(ExecutionError::Callable(e.to_string()))
            },
        }
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn execute(
        &self,
        task: &TaskDefinition,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let started = Instant::now();

        let work = async {
            match &task.work {
                UnitOfWork::Command(cmd) => run_command(&task.id, cmd).await,
                UnitOfWork::Callable(name) => self.run_callable(name, task.metadata.clone()).await,
            }
        };
        let deadline = async {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        // Dropping `work` kills a spawned child and its process group, or
        // drops the async callable.
        let mut result = tokio::select! {
            result = work => result,
            _ = deadline => {
                let limit = timeout.unwrap_or_default();
                warn!(task = %task.id, timeout = %human_duration(limit), "task attempt timed out");
                ExecutionResult::failure(ExecutionError::Timeout(limit))
            }
            _ = cancel.cancelled() => {
                debug!(task = %task.id, "task attempt interrupted by cancellation");
                ExecutionResult::failure(ExecutionError::Cancelled)
            }
        };
        result.duration = started.elapsed();
        result
    }
}

async fn run_command(task_id: &str, cmd: &str) -> ExecutionResult {
    let mut command = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(cmd);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(cmd);
        c
    };

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // The shell leads its own group so anything it forks can be killed with it.
    #[cfg(unix)]
    command.process_group(0);

    debug!(task = %task_id, cmd = %cmd, "spawning task process");

    let child = match command.spawn() {
        Ok(child) => child,
        Err(e) => return ExecutionResult::failure(ExecutionError::Spawn(e.to_string())),
    };
    let group = ProcessGroup { pgid: child.id() };

    let output = match child.wait_with_output().await {
        Ok(output) => output,
        Err(e) => return ExecutionResult::failure(ExecutionError::Spawn(e.to_string())),
    };
    group.disarm();

    let code = output.status.code();
    let error = match code {
        Some(0) => None,
        Some(c) => Some(ExecutionError::NonZeroExit(c)),
        None => Some(ExecutionError::Terminated),
    };

    debug!(task = %task_id, exit_code = ?code, "task process exited");

    ExecutionResult {
        exit_code: code,
        return_value: None,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        error,
        duration: Duration::ZERO,
    }
}

/// Kills a command's process group when the attempt is abandoned before the
/// shell has been reaped.
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn disarm(mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_group(pgid);
        }
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => debug!(pgid, "killed task process group"),
        // Every member already exited.
        Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => warn!(pgid, error = %e, "failed to kill task process group"),
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}
