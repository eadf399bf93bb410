//! Persistence for DAG definitions and runs.
//!
//! Every component reads and writes run state through [`Store`], never by
//! holding on to a `Run` and mutating it. Two backends implement it:
//!
//! - [`MemoryStore`] keeps everything behind one mutex in this process.
//! - [`RedisStore`] keeps one JSON document per DAG and per run in Redis.
//!
//! Task states are embedded in their run record, so a run is the unit of
//! atomicity: both backends serialise read-modify-write cycles per run, which
//! also gives readers a consistent snapshot of all tasks in a run.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use chrono::Utc;

use crate::dag::DagDefinition;
use crate::run::{Run, RunStatus};
use crate::task::TaskState;
use crate::{EngineError, Result};

pub type TaskTransition = Box<dyn FnOnce(&mut TaskState) + Send>;
pub type RunTransition = Box<dyn FnOnce(&mut Run) + Send>;

#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or replace a DAG definition. Existing runs keep their snapshot.
    async fn put_dag(&self, dag: &DagDefinition) -> Result<()>;

    async fn get_dag(&self, dag_id: &str) -> Result<Option<DagDefinition>>;

    /// Every registered DAG, ordered by id.
    async fn list_dags(&self) -> Result<Vec<DagDefinition>>;

    async fn create_run(&self, run: &Run) -> Result<()>;

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>>;

    /// Runs ordered newest first.
    async fn list_runs(&self, limit: Option<usize>) -> Result<Vec<Run>>;

    /// Atomically apply `transition` to one task's state and return the
    /// result. Writers to the same run never interleave. Tasks of a terminal
    /// run are returned unchanged.
    async fn update_task_state(
        &self,
        run_id: &str,
        task_id: &str,
        transition: TaskTransition,
    ) -> Result<TaskState>;

    /// Atomically apply `transition` to the run record. Terminal runs are
    /// returned unchanged.
    async fn update_run(&self, run_id: &str, transition: RunTransition) -> Result<Run>;

    async fn update_run_status(&self, run_id: &str, status: RunStatus) -> Result<Run> {
        self.update_run(
            run_id,
            Box::new(move |run: &mut Run| {
                run.transition(status, Utc::now());
            }),
        )
        .await
    }
}

pub(crate) fn apply_task_transition(
    run: &mut Run,
    task_id: &str,
    transition: TaskTransition,
) -> Result<TaskState> {
    let terminal = run.status.is_terminal();
    let run_id = run.id.clone();
    let state = run
        .tasks
        .get_mut(task_id)
        .ok_or_else(|| EngineError::not_found("task", format!("{}/{}", run_id, task_id)))?;
    if !terminal {
        transition(state);
    }
    Ok(state.clone())
}

pub(crate) fn apply_run_transition(run: &mut Run, transition: RunTransition) {
    if !run.status.is_terminal() {
        transition(run);
    }
}
