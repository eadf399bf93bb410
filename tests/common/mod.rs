#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt};

use dagrunner::{
    DagDefinition, EngineConfig, ExecutionError, ExecutionResult, Executor, MemoryStore,
    RunManager, Store, TaskDefinition,
};

static INIT: Once = Once::new();

/// Initialise tracing for tests. Output is captured per test and only shown
/// for failures unless run with `--nocapture`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt().with_env_filter(filter).with_test_writer().with_target(true).init();
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Started,
    Finished,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub task: String,
    pub kind: EventKind,
    pub at: Instant,
}

#[derive(Debug, Clone, Copy, Default)]
struct Script {
    failures: u32,
    delay: Option<Duration>,
}

/// An executor that never spawns anything. Each task sleeps for a scripted
/// delay, fails its first `failures` attempts, and every start and finish is
/// recorded.
pub struct RecordingExecutor {
    default_delay: Duration,
    scripts: HashMap<String, Script>,
    events: Mutex<Vec<Event>>,
    calls: Mutex<HashMap<String, u32>>,
}

impl RecordingExecutor {
    pub fn new(default_delay: Duration) -> Self {
        Self {
            default_delay,
            scripts: HashMap::new(),
            events: Mutex::new(Vec::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Fail the first `failures` attempts of `task`; `u32::MAX` fails forever.
    pub fn failing(mut self, task: &str, failures: u32) -> Self {
        self.scripts.entry(task.to_string()).or_default().failures = failures;
        self
    }

    pub fn slow(mut self, task: &str, delay: Duration) -> Self {
        self.scripts.entry(task.to_string()).or_default().delay = Some(delay);
        self
    }

    pub fn calls(&self, task: &str) -> u32 {
        self.calls.lock().unwrap().get(task).copied().unwrap_or(0)
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn first(&self, task: &str, kind: EventKind) -> Option<Instant> {
        self.events()
            .into_iter()
            .find(|e| e.task == task && e.kind == kind)
            .map(|e| e.at)
    }

    pub fn last(&self, task: &str, kind: EventKind) -> Option<Instant> {
        self.events()
            .into_iter()
            .rev()
            .find(|e| e.task == task && e.kind == kind)
            .map(|e| e.at)
    }

    fn record(&self, task: &str, kind: EventKind) {
        self.events.lock().unwrap().push(Event {
            task: task.to_string(),
            kind,
            at: Instant::now(),
        });
    }
}

#[async_trait]
impl Executor for RecordingExecutor {
    async fn execute(
        &self,
        task: &TaskDefinition,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let script = self.scripts.get(&task.id).copied().unwrap_or_default();
        let attempt = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.entry(task.id.clone()).or_insert(0);
            *n += 1;
            *n
        };
        self.record(&task.id, EventKind::Started);

        let delay = script.delay.unwrap_or(self.default_delay);
        let limit = timeout.unwrap_or(Duration::MAX);
        let result = tokio::select! {
            _ = tokio::time::sleep(delay.min(limit)) => {
                if delay > limit {
                    ExecutionResult::failure(ExecutionError::Timeout(limit))
                } else if attempt <= script.failures {
                    ExecutionResult::failure(ExecutionError::NonZeroExit(1))
                } else {
                    ExecutionResult::success(format!("{} done", task.id))
                }
            }
            _ = cancel.cancelled() => ExecutionResult::failure(ExecutionError::Cancelled),
        };

        self.record(&task.id, EventKind::Finished);
        result
    }
}

pub fn manager_with(executor: Arc<dyn Executor>, max_concurrency: usize) -> RunManager {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let config = EngineConfig {
        max_concurrency,
        shutdown_grace_seconds: 1,
        ..EngineConfig::default()
    };
    RunManager::new(store, executor, &config)
}

/// A -> {B, C} -> D
pub fn diamond() -> DagDefinition {
    DagDefinition::new("diamond", "Diamond")
        .with_task(TaskDefinition::command("A", "echo A"))
        .with_task(TaskDefinition::command("B", "echo B").depends_on(["A"]))
        .with_task(TaskDefinition::command("C", "echo C").depends_on(["A"]))
        .with_task(TaskDefinition::command("D", "echo D").depends_on(["B", "C"]))
}
