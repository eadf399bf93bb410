use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{RunTransition, Store, TaskTransition, apply_run_transition, apply_task_transition};
use crate::dag::DagDefinition;
use crate::run::{Run, RunId};
use crate::task::TaskState;
use crate::{EngineError, Result};

const CONNECT_ATTEMPTS: u32 = 3;
const MAX_CONNECT_BACKOFF: Duration = Duration::from_secs(10);

/// Redis-backed store.
///
/// Layout under `prefix`:
/// - `{prefix}:dag:{id}`  JSON DAG definition
/// - `{prefix}:dags`      set of DAG ids
/// - `{prefix}:run:{id}`  JSON run record, task states embedded
/// - `{prefix}:runs`      sorted set of run ids scored by creation time (ms)
///
/// Read-modify-write cycles on a run are serialised by a per-run lock held
/// in this process. Coordinating several engine processes over one Redis is
/// not supported.
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    run_locks: Mutex<HashMap<RunId, Arc<Mutex<()>>>>,
}

impl RedisStore {
    /// Connect and verify the server answers `PING`, retrying with backoff.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let mut attempt = 0;

        let conn = loop {
            match Self::open(&client).await {
                Ok(conn) => break conn,
                Err(e) if attempt + 1 < CONNECT_ATTEMPTS => {
                    let delay = Duration::from_secs(2 << attempt).min(MAX_CONNECT_BACKOFF);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "redis connection failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };

        let prefix = prefix.into();
        info!(prefix = %prefix, "connected to redis store");
        Ok(Self {
            conn,
            prefix,
            run_locks: Mutex::new(HashMap::new()),
        })
    }

    async fn open(client: &redis::Client) -> redis::RedisResult<ConnectionManager> {
        let mut conn = client.get_connection_manager().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(conn)
    }

    fn dag_key(&self, dag_id: &str) -> String {
        format!("{}:dag:{}", self.prefix, dag_id)
    }

    fn dags_key(&self) -> String {
        format!("{}:dags", self.prefix)
    }

    fn run_key(&self, run_id: &str) -> String {
        format!("{}:run:{}", self.prefix, run_id)
    }

    fn runs_key(&self) -> String {
        format!("{}:runs", self.prefix)
    }

    async fn run_lock(&self, run_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.run_locks.lock().await;
        Arc::clone(locks.entry(run_id.to_string()).or_default())
    }

    async fn release_if_terminal(&self, run: &Run) {
        if run.status.is_terminal() {
            self.run_locks.lock().await.remove(&run.id);
        }
    }

    #[cfg(test)]
    async fn tracked_locks(&self) -> usize {
        self.run_locks.lock().await.len()
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await?;
        raw.map(|s| serde_json::from_str(&s).map_err(EngineError::from))
            .transpose()
    }

    async fn write_run(&self, run: &Run) -> Result<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(run)?;
        let _: () = conn.set(self.run_key(&run.id), payload).await?;
        Ok(())
    }

    async fn load_run(&self, run_id: &str) -> Result<Run> {
        self.read_json(&self.run_key(run_id))
            .await?
            .ok_or_else(|| EngineError::not_found("run", run_id))
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn put_dag(&self, dag: &DagDefinition) -> Result<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(dag)?;
        let _: () = redis::pipe()
            .atomic()
            .set(self.dag_key(&dag.id), payload)
            .ignore()
            .sadd(self.dags_key(), &dag.id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        debug!(dag_id = %dag.id, "stored DAG definition");
        Ok(())
    }

    async fn get_dag(&self, dag_id: &str) -> Result<Option<DagDefinition>> {
        self.read_json(&self.dag_key(dag_id)).await
    }

    async fn list_dags(&self) -> Result<Vec<DagDefinition>> {
        let mut conn = self.conn.clone();
        let mut ids: Vec<String> = conn.smembers(self.dags_key()).await?;
        ids.sort();

        let mut dags = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(dag) = self.get_dag(&id).await? {
                dags.push(dag);
            }
        }
        Ok(dags)
    }

    async fn create_run(&self, run: &Run) -> Result<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(run)?;
        let _: () = redis::pipe()
            .atomic()
            .set(self.run_key(&run.id), payload)
            .ignore()
            .zadd(self.runs_key(), &run.id, run.created_at.timestamp_millis())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        self.read_json(&self.run_key(run_id)).await
    }

    async fn list_runs(&self, limit: Option<usize>) -> Result<Vec<Run>> {
        let stop = match limit {
            Some(0) => return Ok(Vec::new()),
            Some(n) => n as isize - 1,
            None => -1,
        };
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.zrevrange(self.runs_key(), 0, stop).await?;

        let mut runs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(run) = self.get_run(&id).await? {
                runs.push(run);
            }
        }
        Ok(runs)
    }

    async fn update_task_state(
        &self,
        run_id: &str,
        task_id: &str,
        transition: TaskTransition,
    ) -> Result<TaskState> {
        let lock = self.run_lock(run_id).await;
        let _guard = lock.lock().await;

        let mut run = self.load_run(run_id).await?;
        let was_terminal = run.status.is_terminal();
        let state = apply_task_transition(&mut run, task_id, transition)?;
        if !was_terminal {
            self.write_run(&run).await?;
        }
        self.release_if_terminal(&run).await;
        Ok(state)
    }

    async fn update_run(&self, run_id: &str, transition: RunTransition) -> Result<Run> {
        let lock = self.run_lock(run_id).await;
        let _guard = lock.lock().await;

        let mut run = self.load_run(run_id).await?;
        if !run.status.is_terminal() {
            apply_run_transition(&mut run, transition);
            self.write_run(&run).await?;
        }
        self.release_if_terminal(&run).await;
        Ok(run)
    }
}
