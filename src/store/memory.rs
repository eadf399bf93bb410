use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{RunTransition, Store, TaskTransition, apply_run_transition, apply_task_transition};
use crate::dag::DagDefinition;
use crate::run::{Run, RunId};
use crate::task::TaskState;
use crate::{EngineError, Result};

#[derive(Default)]
struct Inner {
    dags: BTreeMap<String, DagDefinition>,
    runs: HashMap<RunId, Run>,
}

/// In-process store. A single mutex guards all records, which makes every
/// operation atomic with respect to every other.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put_dag(&self, dag: &DagDefinition) -> Result<()> {
        self.inner
            .lock()
            .await
            .dags
            .insert(dag.id.clone(), dag.clone());
        Ok(())
    }

    async fn get_dag(&self, dag_id: &str) -> Result<Option<DagDefinition>> {
        Ok(self.inner.lock().await.dags.get(dag_id).cloned())
    }

    async fn list_dags(&self) -> Result<Vec<DagDefinition>> {
        Ok(self.inner.lock().await.dags.values().cloned().collect())
    }

    async fn create_run(&self, run: &Run) -> Result<()> {
        self.inner
            .lock()
            .await
            .runs
            .insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        Ok(self.inner.lock().await.runs.get(run_id).cloned())
    }

    async fn list_runs(&self, limit: Option<usize>) -> Result<Vec<Run>> {
        let mut runs: Vec<Run> = self.inner.lock().await.runs.values().cloned().collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = limit {
            runs.truncate(limit);
        }
        Ok(runs)
    }

    async fn update_task_state(
        &self,
        run_id: &str,
        task_id: &str,
        transition: TaskTransition,
    ) -> Result<TaskState> {
        let mut inner = self.inner.lock().await;
        let run = inner
            .runs
            .get_mut(run_id)
            .ok_or_else(|| EngineError::not_found("run", run_id))?;
        apply_task_transition(run, task_id, transition)
    }

    async fn update_run(&self, run_id: &str, transition: RunTransition) -> Result<Run> {
        let mut inner = self.inner.lock().await;
        let run = inner
            .runs
            .get_mut(run_id)
            .ok_or_else(|| EngineError::not_found("run", run_id))?;
        apply_run_transition(run, transition);
        Ok(run.clone())
    }
}
