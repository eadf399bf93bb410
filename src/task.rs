use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type TaskId = String;
pub type Metadata = HashMap<String, serde_json::Value>;

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// What a task actually does when it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitOfWork {
    /// Shell command, run through `sh -c`.
    Command(String),
    /// Name of a callable registered in the [`CallableRegistry`](crate::CallableRegistry).
    Callable(String),
}

impl UnitOfWork {
    pub fn kind(&self) -> &'static str {
        match self {
            UnitOfWork::Command(_) => "command",
            UnitOfWork::Callable(_) => "callable",
        }
    }

    pub fn target(&self) -> &str {
        match self {
            UnitOfWork::Command(cmd) => cmd,
            UnitOfWork::Callable(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: TaskId,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub work: UnitOfWork,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub retries: u32,
    #[serde(
        rename = "retry_delay_seconds",
        with = "secs",
        default = "default_retry_delay"
    )]
    pub retry_delay: Duration,
    #[serde(rename = "timeout_seconds", with = "opt_secs", default)]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub metadata: Metadata,
}

fn default_retry_delay() -> Duration {
    DEFAULT_RETRY_DELAY
}

impl TaskDefinition {
    fn new(id: impl Into<String>, work: UnitOfWork) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            work,
            dependencies: Vec::new(),
            retries: 0,
            retry_delay: DEFAULT_RETRY_DELAY,
            timeout: None,
            metadata: Metadata::new(),
        }
    }

    pub fn command(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self::new(id, UnitOfWork::Command(command.into()))
    }

    pub fn callable(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, UnitOfWork::Callable(name.into()))
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    Pending,
    Ready,
    Running,
    RetryWait,
    Success,
    Failed,
    Skipped,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Skipped | TaskStatus::Cancelled
        )
    }

    /// A dependency in one of these states can never let its dependents run.
    pub fn blocks_dependents(self) -> bool {
        matches!(
            self,
            TaskStatus::Failed | TaskStatus::Skipped | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Ready => "READY",
            TaskStatus::Running => "RUNNING",
            TaskStatus::RetryWait => "RETRY_WAIT",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Skipped => "SKIPPED",
            TaskStatus::Cancelled => "CANCELLED",
        };
        f.pad(s)
    }
}

/// Captured result of the last attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub exit_code: Option<i32>,
    pub return_value: Option<serde_json::Value>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub status: TaskStatus,
    pub attempt: u32,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output: Option<TaskOutput>,
    #[serde(default)]
    pub history: Vec<AttemptRecord>,
    #[serde(default)]
    attempt_started_at: Option<DateTime<Utc>>,
}

impl TaskState {
    /// Enter `RUNNING` for a new attempt.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Running;
        self.attempt += 1;
        self.started_at.get_or_insert(now);
        self.attempt_started_at = Some(now);
    }

    /// Close the attempt currently in flight, if any.
    pub fn close_attempt(&mut self, error: Option<String>, now: DateTime<Utc>) {
        let Some(started_at) = self.attempt_started_at.take() else {
            return;
        };
        let elapsed = (now - started_at).to_std().unwrap_or_default();
        self.history.push(AttemptRecord {
            attempt: self.attempt,
            started_at,
            finished_at: now,
            duration: human_duration(elapsed),
            error: error.clone(),
        });
        if error.is_some() {
            self.last_error = error;
        }
    }

    pub fn finish(&mut self, status: TaskStatus, now: DateTime<Utc>) {
        self.status = status;
        self.finished_at = Some(now);
    }
}

/// Formats a duration as `1h 2m 3.000s`, `2m 5.500s` or `0.250s`.
pub fn human_duration(d: Duration) -> String {
    let total = d.as_secs_f64();
    let hours = (total / 3600.0).floor() as u64;
    let minutes = ((total % 3600.0) / 60.0).floor() as u64;
    let seconds = total % 60.0;

    if hours > 0 {
        format!("{}h {}m {:.3}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {:.3}s", minutes, seconds)
    } else {
        format!("{:.3}s", seconds)
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(d)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}
