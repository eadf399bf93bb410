use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::run::{Run, RunStatus};
use crate::store::Store;
use crate::task::{TaskId, TaskState, TaskStatus};
use crate::worker::Worker;
use crate::{EngineError, Result};

type Joined = std::result::Result<(TaskId, std::thread::Result<Result<TaskState>>), JoinError>;

/// Outcome of one scheduling pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Pass {
    /// `RUNNING` while any task is live, otherwise the status the run settles on.
    pub status: RunStatus,
    /// Tasks moved to `READY` by this pass, in DAG insertion order.
    pub ready: Vec<TaskId>,
    /// Cancellation has been persisted for the run.
    pub cancel_requested: bool,
}

/// Drives the runs of DAGs: decides which tasks may start, hands them to a
/// bounded pool of workers and settles the run once every task is terminal.
pub struct Scheduler {
    store: Arc<dyn Store>,
    worker: Arc<Worker>,
    max_concurrency: usize,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, worker: Arc<Worker>, max_concurrency: usize) -> Self {
        Self {
            store,
            worker,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    async fn load(&self, run_id: &str) -> Result<Run> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::not_found("run", run_id))
    }

    /// One scheduling pass over `run_id`.
    ///
    /// Pending tasks behind a failed, skipped or cancelled dependency are
    /// skipped (cascading in topological order), and pending tasks whose
    /// dependencies all succeeded are marked `READY`. Nothing is marked ready
    /// once cancellation has been requested.
    pub async fn advance(&self, run_id: &str) -> Result<Pass> {
        let mut run = self.load(run_id).await?;
        if run.status.is_terminal() {
            return Ok(Pass {
                status: run.status,
                ready: Vec::new(),
                cancel_requested: run.cancel_requested,
            });
        }
        if run.status == RunStatus::Pending {
            run = self.store.update_run_status(run_id, RunStatus::Running).await?;
            info!(run_id, dag_id = %run.dag_id, tasks = run.tasks.len(), "run started");
        }

        let dag = run.dag.clone();
        for id in dag.topological_order() {
            if run.task_status(&id) != Some(TaskStatus::Pending) {
                continue;
            }
            let Some(task) = dag.task(&id) else { continue };
            let blocked_by = task.dependencies.iter().find_map(|dep| match run.task_status(dep) {
                Some(status) if status.blocks_dependents() => {
                    Some(format!("dependency '{}' ended {}", dep, status))
                }
                _ => None,
            });
            if let Some(reason) = blocked_by {
                let state = self.worker.skip_task(run_id, &id, reason).await?;
                run.tasks.insert(id, state);
            }
        }

        let mut ready = Vec::new();
        if !run.cancel_requested {
            for task in &dag.tasks {
                if run.task_status(&task.id) != Some(TaskStatus::Pending) {
                    continue;
                }
                let deps_met = task
                    .dependencies
                    .iter()
                    .all(|dep| run.task_status(dep) == Some(TaskStatus::Success));
                if !deps_met {
                    continue;
                }
                let state = self
                    .store
                    .update_task_state(
                        run_id,
                        &task.id,
                        Box::new(|s: &mut TaskState| {
                            if s.status == TaskStatus::Pending {
                                s.status = TaskStatus::Ready;
                            }
                        }),
                    )
                    .await?;
                if state.status == TaskStatus::Ready {
                    debug!(run_id, task = %task.id, "task ready");
                    ready.push(task.id.clone());
                }
                run.tasks.insert(task.id.clone(), state);
            }
        }

        Ok(Pass {
            status: run.settled_status().unwrap_or(RunStatus::Running),
            ready,
            cancel_requested: run.cancel_requested,
        })
    }

    /// Run the scheduling loop for `run_id` until the run is terminal.
    ///
    /// Ready tasks are dispatched in DAG insertion order, at most
    /// `max_concurrency` at a time. Once `cancel` fires no further task is
    /// dispatched, in-flight workers are told to abort, and the run ends
    /// `CANCELLED` after they have settled.
    pub async fn drive(&self, run_id: &str, cancel: CancellationToken) -> Result<Run> {
        let dag = self.load(run_id).await?.dag;
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut in_flight: JoinSet<(TaskId, std::thread::Result<Result<TaskState>>)> =
            JoinSet::new();

        debug!(run_id, max_concurrency = self.max_concurrency, "scheduling loop started");

        loop {
            if cancel.is_cancelled() {
                return self.wind_down(run_id, in_flight).await;
            }

            let pass = self.advance(run_id).await?;
            if pass.status.is_terminal() && in_flight.is_empty() {
                return self.settle(run_id, pass.status).await;
            }
            if pass.cancel_requested {
                // Recorded by a caller that does not hold this loop's token.
                cancel.cancel();
                continue;
            }
            if pass.ready.is_empty() && in_flight.is_empty() {
                self.fail_stalled(run_id).await?;
                continue;
            }

            for task_id in pass.ready {
                let permit = tokio::select! {
                    permit = Arc::clone(&semaphore).acquire_owned() => permit,
                    _ = cancel.cancelled() => break,
                };
                let Ok(permit) = permit else { break };
                let Some(task) = dag.task(&task_id).cloned() else {
                    continue;
                };

                let worker = Arc::clone(&self.worker);
                let token = cancel.clone();
                let run_id = run_id.to_string();
                in_flight.spawn(async move {
                    let _permit = permit;
                    let outcome = AssertUnwindSafe(worker.run_task(&run_id, &task, &token))
                        .catch_unwind()
                        .await;
                    (task.id, outcome)
                });
            }

            if in_flight.is_empty() {
                continue;
            }
            tokio::select! {
                Some(joined) = in_flight.join_next() => self.reap(run_id, joined).await?,
                _ = cancel.cancelled() => {}
            }
        }
    }

    async fn reap(&self, run_id: &str, joined: Joined) -> Result<()> {
        match joined {
            Ok((task_id, Ok(Ok(state)))) => {
                debug!(run_id, task = %task_id, status = %state.status, "worker finished");
            }
            Ok((task_id, Ok(Err(e)))) => {
                error!(run_id, task = %task_id, error = %e, "worker could not record task state");
                self.worker.fail_task(run_id, &task_id, e.to_string()).await?;
            }
            Ok((task_id, Err(_))) => {
                error!(run_id, task = %task_id, "worker panicked");
                self.worker
                    .fail_task(run_id, &task_id, "worker panicked".to_string())
                    .await?;
            }
            Err(e) => {
                error!(run_id, error = %e, "worker task aborted");
            }
        }
        Ok(())
    }

    async fn settle(&self, run_id: &str, status: RunStatus) -> Result<Run> {
        let run = self.store.update_run_status(run_id, status).await?;
        match run.status {
            RunStatus::Success => info!(run_id, "run succeeded"),
            RunStatus::Failed => warn!(run_id, "run failed"),
            status => info!(run_id, %status, "run finished"),
        }
        Ok(run)
    }

    /// Nothing is ready and nothing is running, yet some task is live: its
    /// worker is gone. Fail it so the run can settle.
    async fn fail_stalled(&self, run_id: &str) -> Result<()> {
        let run = self.load(run_id).await?;
        for task in &run.dag.tasks {
            let Some(status) = run.task_status(&task.id) else { continue };
            if !status.is_terminal() && status != TaskStatus::Pending {
                warn!(run_id, task = %task.id, %status, "task has no active worker");
                self.worker
                    .fail_task(run_id, &task.id, format!("task stalled in {}", status))
                    .await?;
            }
        }
        Ok(())
    }

    async fn wind_down(
        &self,
        run_id: &str,
        mut in_flight: JoinSet<(TaskId, std::thread::Result<Result<TaskState>>)>,
    ) -> Result<Run> {
        info!(run_id, in_flight = in_flight.len(), "cancelling run; draining workers");
        while let Some(joined) = in_flight.join_next().await {
            self.reap(run_id, joined).await?;
        }
        self.cancel_remaining(run_id).await
    }

    /// Cancel every task that has not reached a terminal state and close the
    /// run as `CANCELLED`. Used once no worker is active for the run.
    pub async fn cancel_remaining(&self, run_id: &str) -> Result<Run> {
        let run = self.load(run_id).await?;
        for task in &run.dag.tasks {
            if run.task_status(&task.id).is_some_and(|s| !s.is_terminal()) {
                self.worker.cancel_task(run_id, &task.id).await?;
            }
        }
        let run = self
            .store
            .update_run(
                run_id,
                Box::new(|run: &mut Run| {
                    run.cancel_requested = true;
                    run.transition(RunStatus::Cancelled, Utc::now());
                }),
            )
            .await?;
        info!(run_id, status = %run.status, "run cancelled");
        Ok(run)
    }
}
