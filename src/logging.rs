//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! Priority for determining the filter:
//! 1. explicit level passed by the caller (e.g. from [`EngineConfig`](crate::EngineConfig))
//! 2. `DAGRUNNER_LOG` environment variable
//! 3. `RUST_LOG` environment variable
//! 4. default to `info`

use tracing_subscriber::EnvFilter;

use crate::{EngineError, Result};

pub const LOG_ENV: &str = "DAGRUNNER_LOG";

/// Install the global fmt subscriber, writing to stderr.
///
/// Fails with [`EngineError::Config`] if the directive does not parse or a
/// global subscriber is already installed.
pub fn init_logging(level: Option<&str>) -> Result<()> {
    let directive = resolve_directive(level, |key| std::env::var(key).ok());
    let filter = EnvFilter::try_new(&directive)
        .map_err(|e| EngineError::Config(format!("invalid log filter '{}': {}", directive, e)))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init()
        .map_err(|e| EngineError::Config(format!("logging already initialised: {}", e)))
}

fn resolve_directive(level: Option<&str>, lookup: impl Fn(&str) -> Option<String>) -> String {
    level
        .map(str::to_string)
        .or_else(|| lookup(LOG_ENV))
        .or_else(|| lookup("RUST_LOG"))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "info".to_string())
}
