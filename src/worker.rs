use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::executor::{ExecutionError, Executor};
use crate::retry::{RetryPolicy, sleep_or_cancel};
use crate::store::Store;
use crate::task::{TaskDefinition, TaskOutput, TaskState, TaskStatus, human_duration};
use crate::Result;

/// Drives one task of one run from `READY` to a terminal state, retrying
/// failed attempts. Every state change goes through the store.
pub struct Worker {
    store: Arc<dyn Store>,
    executor: Arc<dyn Executor>,
    max_retry_delay: Option<Duration>,
}

impl Worker {
    pub fn new(store: Arc<dyn Store>, executor: Arc<dyn Executor>) -> Self {
        Self {
            store,
            executor,
            max_retry_delay: None,
        }
    }

    pub fn with_max_retry_delay(mut self, max_retry_delay: Option<Duration>) -> Self {
        self.max_retry_delay = max_retry_delay;
        self
    }

    /// Run `task` until it succeeds, exhausts its retries or is cancelled.
    ///
    /// Execution failures and timeouts never surface as `Err`; they end up in
    /// the returned state. `Err` means the store could not be updated.
    pub async fn run_task(
        &self,
        run_id: &str,
        task: &TaskDefinition,
        cancel: &CancellationToken,
    ) -> Result<TaskState> {
        let policy = RetryPolicy::for_task(task, self.max_retry_delay);

        loop {
            if cancel.is_cancelled() {
                return self.cancel_task(run_id, &task.id).await;
            }

            let token = cancel.clone();
            let state = self
                .store
                .update_task_state(
                    run_id,
                    &task.id,
                    Box::new(move |s: &mut TaskState| {
                        if !token.is_cancelled()
                            && matches!(s.status, TaskStatus::Ready | TaskStatus::RetryWait)
                        {
                            s.begin_attempt(Utc::now());
                        }
                    }),
                )
                .await?;
            if state.status != TaskStatus::Running {
                if cancel.is_cancelled() && !state.status.is_terminal() {
                    return self.cancel_task(run_id, &task.id).await;
                }
                debug!(run_id, task = %task.id, status = %state.status, "task no longer runnable");
                return Ok(state);
            }

            let attempt = state.attempt;
            info!(
                run_id,
                task = %task.id,
                attempt,
                max_attempts = policy.max_attempts(),
                kind = task.work.kind(),
                "task attempt started"
            );

            let result = self.executor.execute(task, task.timeout, cancel).await;
            let output = result.output();
            let took = human_duration(result.duration);

            match result.error {
                None => {
                    info!(run_id, task = %task.id, attempt, duration = %took, "task succeeded");
                    return self
                        .finish_attempt(run_id, &task.id, None, output, TaskStatus::Success)
                        .await;
                }
                Some(ExecutionError::Cancelled) => {
                    info!(run_id, task = %task.id, attempt, "task cancelled while running");
                    return self
                        .finish_attempt(
                            run_id,
                            &task.id,
                            Some(ExecutionError::Cancelled.to_string()),
                            output,
                            TaskStatus::Cancelled,
                        )
                        .await;
                }
                Some(err) if policy.should_retry(attempt) => {
                    let delay = policy.backoff(attempt);
                    warn!(
                        run_id,
                        task = %task.id,
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "task attempt failed; retrying"
                    );
                    let state = self
                        .finish_attempt(
                            run_id,
                            &task.id,
                            Some(err.to_string()),
                            output,
                            TaskStatus::RetryWait,
                        )
                        .await?;
                    if state.status != TaskStatus::RetryWait {
                        return Ok(state);
                    }

                    if !sleep_or_cancel(delay, cancel).await {
                        info!(run_id, task = %task.id, "retry wait interrupted by cancellation");
                        return self.cancel_task(run_id, &task.id).await;
                    }
                }
                Some(err) => {
                    error!(
                        run_id,
                        task = %task.id,
                        attempts = attempt,
                        error = %err,
                        "task failed; retries exhausted"
                    );
                    return self
                        .finish_attempt(
                            run_id,
                            &task.id,
                            Some(err.to_string()),
                            output,
                            TaskStatus::Failed,
                        )
                        .await;
                }
            }
        }
    }

    async fn finish_attempt(
        &self,
        run_id: &str,
        task_id: &str,
        error: Option<String>,
        output: TaskOutput,
        next: TaskStatus,
    ) -> Result<TaskState> {
        self.store
            .update_task_state(
                run_id,
                task_id,
                Box::new(move |s: &mut TaskState| {
                    if s.status != TaskStatus::Running {
                        return;
                    }
                    let now = Utc::now();
                    s.close_attempt(error, now);
                    s.output = Some(output);
                    if next.is_terminal() {
                        s.finish(next, now);
                    } else {
                        s.status = next;
                    }
                }),
            )
            .await
    }

    /// Mark a task that never ran as `SKIPPED` because an upstream task
    /// failed, was skipped or was cancelled.
    pub async fn skip_task(&self, run_id: &str, task_id: &str, reason: String) -> Result<TaskState> {
        info!(run_id, task = %task_id, reason = %reason, "skipping task");
        self.store
            .update_task_state(
                run_id,
                task_id,
                Box::new(move |s: &mut TaskState| {
                    if matches!(s.status, TaskStatus::Pending | TaskStatus::Ready) {
                        s.last_error = Some(reason);
                        s.finish(TaskStatus::Skipped, Utc::now());
                    }
                }),
            )
            .await
    }

    /// Force a non-terminal task to `FAILED`, closing its open attempt.
    pub async fn fail_task(&self, run_id: &str, task_id: &str, reason: String) -> Result<TaskState> {
        error!(run_id, task = %task_id, reason = %reason, "failing task");
        self.store
            .update_task_state(
                run_id,
                task_id,
                Box::new(move |s: &mut TaskState| {
                    if s.status.is_terminal() {
                        return;
                    }
                    let now = Utc::now();
                    s.close_attempt(Some(reason.clone()), now);
                    s.last_error = Some(reason);
                    s.finish(TaskStatus::Failed, now);
                }),
            )
            .await
    }

    /// Reconcile a task whose worker vanished with the previous process.
    ///
    /// `RUNNING` and `RETRY_WAIT` tasks get an interrupted attempt on record
    /// and go back to `PENDING` while attempts remain, otherwise `FAILED`.
    /// `READY` tasks simply return to `PENDING`.
    pub async fn requeue_interrupted(&self, run_id: &str, task: &TaskDefinition) -> Result<TaskState> {
        let policy = RetryPolicy::for_task(task, self.max_retry_delay);
        self.store
            .update_task_state(
                run_id,
                &task.id,
                Box::new(move |s: &mut TaskState| match s.status {
                    TaskStatus::Ready => s.status = TaskStatus::Pending,
                    TaskStatus::Running | TaskStatus::RetryWait => {
                        let now = Utc::now();
                        let reason = "interrupted by engine restart".to_string();
                        s.close_attempt(Some(reason.clone()), now);
                        s.last_error = Some(reason);
                        if policy.should_retry(s.attempt) {
                            s.status = TaskStatus::Pending;
                        } else {
                            s.finish(TaskStatus::Failed, now);
                        }
                    }
                    _ => {}
                }),
            )
            .await
    }

    /// Force a non-terminal task to `CANCELLED`.
    pub async fn cancel_task(&self, run_id: &str, task_id: &str) -> Result<TaskState> {
        self.store
            .update_task_state(
                run_id,
                task_id,
                Box::new(|s: &mut TaskState| {
                    if s.status.is_terminal() {
                        return;
                    }
                    let now = Utc::now();
                    s.close_attempt(Some(ExecutionError::Cancelled.to_string()), now);
                    s.finish(TaskStatus::Cancelled, now);
                }),
            )
            .await
    }
}
