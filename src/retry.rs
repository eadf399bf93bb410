use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::task::TaskDefinition;

/// Retry budget and backoff for one task.
///
/// The wait after failed attempt `n` (1-based) is `delay * n`, optionally
/// capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
    pub max_delay: Option<Duration>,
}

impl RetryPolicy {
    pub fn for_task(task: &TaskDefinition, max_delay: Option<Duration>) -> Self {
        Self {
            retries: task.retries,
            delay: task.retry_delay,
            max_delay,
        }
    }

    /// Total number of attempts a task may make.
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Whether another attempt is allowed after `attempt` attempts have failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts()
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let wait = self.delay.saturating_mul(attempt.max(1));
        match self.max_delay {
            Some(cap) => wait.min(cap),
            None => wait,
        }
    }
}

/// Sleeps for `duration` unless `cancel` fires first. Returns `false` when
/// the wait was cut short by cancellation.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = sleep(duration) => true,
    }
}
