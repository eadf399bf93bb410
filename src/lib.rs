pub mod callable;
pub mod config;
pub mod cycle_check;
pub mod dag;
pub mod executor;
pub mod logging;
pub mod manager;
pub mod retry;
pub mod run;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod worker;

pub use callable::{CallableError, CallableRegistry};
pub use config::{EngineConfig, open_store};
pub use cycle_check::{ValidationError, validate};
pub use dag::DagDefinition;
pub use executor::{ExecutionError, ExecutionResult, Executor, ProcessExecutor};
pub use logging::init_logging;
pub use manager::RunManager;
pub use retry::RetryPolicy;
pub use run::{Run, RunId, RunStatus};
pub use scheduler::{Pass, Scheduler};
pub use store::{MemoryStore, RedisStore, Store};
pub use task::{Metadata, TaskDefinition, TaskId, TaskOutput, TaskState, TaskStatus, UnitOfWork};
pub use worker::Worker;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("run {run_id} already finished with status {status}")]
    AlreadyTerminal { run_id: RunId, status: RunStatus },
    #[error("engine is shutting down")]
    ShuttingDown,
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
