use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{EngineConfig, open_store};
use crate::cycle_check::{ValidationError, validate};
use crate::dag::DagDefinition;
use crate::executor::Executor;
use crate::run::{Run, RunId, RunStatus};
use crate::scheduler::Scheduler;
use crate::store::Store;
use crate::task::TaskStatus;
use crate::worker::Worker;
use crate::{EngineError, Result};

struct ActiveRun {
    cancel: CancellationToken,
    finished: CancellationToken,
}

/// Scheduling loops currently alive in this process, keyed by run id.
struct RunRegistry {
    runs: Mutex<HashMap<RunId, ActiveRun>>,
    accepting: AtomicBool,
    root: CancellationToken,
}

impl RunRegistry {
    fn new() -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            root: CancellationToken::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RunId, ActiveRun>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cancel_token(&self, run_id: &str) -> Option<CancellationToken> {
        self.lock().get(run_id).map(|r| r.cancel.clone())
    }

    fn finished_token(&self, run_id: &str) -> Option<CancellationToken> {
        self.lock().get(run_id).map(|r| r.finished.clone())
    }

    fn all_finished_tokens(&self) -> Vec<CancellationToken> {
        self.lock().values().map(|r| r.finished.clone()).collect()
    }
}

/// Deregisters a run and wakes its waiters when its loop ends, however it ends.
struct LoopGuard {
    registry: Arc<RunRegistry>,
    run_id: RunId,
    finished: CancellationToken,
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.run_id);
        self.finished.cancel();
    }
}

/// Front door of the engine. Owns the scheduling loop of every active run.
#[derive(Clone)]
pub struct RunManager {
    store: Arc<dyn Store>,
    scheduler: Arc<Scheduler>,
    registry: Arc<RunRegistry>,
    shutdown_grace: Duration,
}

impl RunManager {
    pub fn new(store: Arc<dyn Store>, executor: Arc<dyn Executor>, config: &EngineConfig) -> Self {
        let worker = Worker::new(Arc::clone(&store), executor)
            .with_max_retry_delay(config.max_retry_delay());
        let scheduler = Scheduler::new(Arc::clone(&store), Arc::new(worker), config.max_concurrency);
        Self {
            store,
            scheduler: Arc::new(scheduler),
            registry: Arc::new(RunRegistry::new()),
            shutdown_grace: config.shutdown_grace(),
        }
    }

    /// Open the configured store and build a manager on top of it.
    pub async fn from_config(config: &EngineConfig, executor: Arc<dyn Executor>) -> Result<Self> {
        config.validate()?;
        let store = open_store(config).await?;
        Ok(Self::new(store, executor, config))
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Validate and persist `dag`, replacing any definition with the same id.
    /// A DAG that fails validation is never stored.
    pub async fn register_dag(&self, dag: DagDefinition) -> Result<()> {
        if let Err(e) = validate(&dag) {
            warn!(dag_id = %dag.id, error = %e, "rejected DAG");
            return Err(e.into());
        }
        self.store.put_dag(&dag).await?;
        info!(dag_id = %dag.id, tasks = dag.tasks.len(), "registered DAG");
        Ok(())
    }

    pub async fn get_dag(&self, dag_id: &str) -> Result<DagDefinition> {
        self.store
            .get_dag(dag_id)
            .await?
            .ok_or_else(|| EngineError::not_found("dag", dag_id))
    }

    pub async fn list_dags(&self) -> Result<Vec<DagDefinition>> {
        self.store.list_dags().await
    }

    /// Create a run of `dag_id` with every task `PENDING` and start its
    /// scheduling loop. Returns the run as first persisted.
    pub async fn trigger(&self, dag_id: &str) -> Result<Run> {
        if !self.registry.accepting.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }
        let dag = self.get_dag(dag_id).await?;
        if dag.is_empty() {
            return Err(ValidationError::EmptyDag.into());
        }

        let run = Run::new(dag);
        self.store.create_run(&run).await?;
        info!(run_id = %run.id, dag_id, "run triggered");
        self.spawn_loop(run.id.clone());
        Ok(run)
    }

    fn spawn_loop(&self, run_id: RunId) {
        let cancel = self.registry.root.child_token();
        let finished = CancellationToken::new();
        self.registry.lock().insert(
            run_id.clone(),
            ActiveRun {
                cancel: cancel.clone(),
                finished: finished.clone(),
            },
        );

        let guard = LoopGuard {
            registry: Arc::clone(&self.registry),
            run_id: run_id.clone(),
            finished,
        };
        let scheduler = Arc::clone(&self.scheduler);
        let store = Arc::clone(&self.store);

        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = scheduler.drive(&run_id, cancel).await {
                error!(run_id = %run_id, error = %e, "scheduling loop aborted");
                if let Err(e) = store.update_run_status(&run_id, RunStatus::Failed).await {
                    error!(run_id = %run_id, error = %e, "could not mark run failed");
                }
            }
        });
    }

    pub async fn get_status(&self, run_id: &str) -> Result<Run> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::not_found("run", run_id))
    }

    /// Request cancellation of a run. The run reaches `CANCELLED` once its
    /// in-flight tasks have settled; use [`RunManager::wait`] to observe that.
    pub async fn cancel(&self, run_id: &str) -> Result<()> {
        let run = self.get_status(run_id).await?;
        if run.status.is_terminal() {
            return Err(EngineError::AlreadyTerminal {
                run_id: run.id,
                status: run.status,
            });
        }

        let token = self.registry.cancel_token(run_id);
        if let Some(token) = &token {
            token.cancel();
        }
        self.store
            .update_run(run_id, Box::new(|run: &mut Run| run.cancel_requested = true))
            .await?;
        info!(run_id, active = token.is_some(), "cancellation requested");

        if token.is_none() {
            self.scheduler.cancel_remaining(run_id).await?;
        }
        Ok(())
    }

    pub async fn list_runs(&self, limit: Option<usize>) -> Result<Vec<Run>> {
        self.store.list_runs(limit).await
    }

    /// Ids of runs whose scheduling loop is alive in this process.
    pub fn active_runs(&self) -> Vec<RunId> {
        self.registry.lock().keys().cloned().collect()
    }

    /// Wait for the run's scheduling loop to end and return the final record.
    /// Returns the current record straight away if no loop is active.
    pub async fn wait(&self, run_id: &str) -> Result<Run> {
        if let Some(finished) = self.registry.finished_token(run_id) {
            finished.cancelled().await;
        }
        self.get_status(run_id).await
    }

    /// Reconcile runs left unfinished by a previous process and resume them.
    ///
    /// Tasks caught `RUNNING` or `RETRY_WAIT` are treated as a failed attempt
    /// and requeued while attempts remain. Runs that had a cancellation
    /// request are closed as `CANCELLED` instead of resumed. Returns the ids
    /// of resumed runs.
    pub async fn recover(&self) -> Result<Vec<RunId>> {
        if !self.registry.accepting.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }

        let mut resumed = Vec::new();
        for run in self.store.list_runs(None).await? {
            if run.status.is_terminal() || self.registry.cancel_token(&run.id).is_some() {
                continue;
            }

            for task in &run.dag.tasks {
                let interrupted = matches!(
                    run.task_status(&task.id),
                    Some(TaskStatus::Ready | TaskStatus::Running | TaskStatus::RetryWait)
                );
                if interrupted {
                    self.scheduler
                        .worker()
                        .requeue_interrupted(&run.id, task)
                        .await?;
                }
            }

            if run.cancel_requested {
                self.scheduler.cancel_remaining(&run.id).await?;
                continue;
            }

            warn!(run_id = %run.id, dag_id = %run.dag_id, "resuming interrupted run");
            self.spawn_loop(run.id.clone());
            resumed.push(run.id);
        }
        Ok(resumed)
    }

    /// Stop accepting new runs, give active runs the grace period to finish,
    /// then cancel whatever is left and wait for it to settle.
    pub async fn shutdown(&self) {
        self.registry.accepting.store(false, Ordering::SeqCst);
        let pending = self.registry.all_finished_tokens();
        if pending.is_empty() {
            info!("engine stopped");
            return;
        }

        info!(
            active = pending.len(),
            grace_secs = self.shutdown_grace.as_secs(),
            "shutting down; waiting for active runs"
        );
        let drained = join_all(pending.iter().map(|t| t.cancelled()));
        if tokio::time::timeout(self.shutdown_grace, drained).await.is_err() {
            warn!("grace period elapsed; cancelling remaining runs");
            self.registry.root.cancel();
            join_all(pending.iter().map(|t| t.cancelled())).await;
        }
        info!("engine stopped");
    }
}
