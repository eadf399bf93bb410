use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::store::{MemoryStore, RedisStore, Store};
use crate::{EngineError, Result};

pub const DEFAULT_MAX_CONCURRENCY: usize = 4;
pub const DEFAULT_KEY_PREFIX: &str = "orchestrator";
pub const DEFAULT_SHUTDOWN_GRACE_SECONDS: u64 = 30;

/// Engine settings, loadable from TOML. Every field has a default, so an
/// empty file is a valid configuration.
///
/// ```toml
/// max_concurrency = 8
/// max_retry_delay_seconds = 60.0
/// redis_url = "redis://127.0.0.1:6379"
/// key_prefix = "orchestrator"
/// shutdown_grace_seconds = 30
/// log_level = "info"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Tasks of one run executing at the same time.
    pub max_concurrency: usize,
    /// Cap on a single backoff wait. Unset keeps pure linear scaling.
    pub max_retry_delay_seconds: Option<f64>,
    /// Selects the Redis backend when set; otherwise runs are kept in memory.
    pub redis_url: Option<String>,
    pub key_prefix: String,
    pub shutdown_grace_seconds: u64,
    pub log_level: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_retry_delay_seconds: None,
            redis_url: None,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            shutdown_grace_seconds: DEFAULT_SHUTDOWN_GRACE_SECONDS,
            log_level: None,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Apply `REDIS_URL`, `DAGRUNNER_MAX_CONCURRENCY` and `DAGRUNNER_LOG`
    /// from `lookup`, typically `|k| std::env::var(k).ok()`.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(url) = lookup("REDIS_URL").filter(|u| !u.trim().is_empty()) {
            self.redis_url = Some(url);
        }
        if let Some(raw) = lookup("DAGRUNNER_MAX_CONCURRENCY") {
            self.max_concurrency = raw.trim().parse().map_err(|_| {
                EngineError::Config(format!("DAGRUNNER_MAX_CONCURRENCY is not a number: '{}'", raw))
            })?;
        }
        if let Some(level) = lookup(crate::logging::LOG_ENV) {
            self.log_level = Some(level);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(EngineError::Config(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if let Some(cap) = self.max_retry_delay_seconds {
            Duration::try_from_secs_f64(cap).map_err(|e| {
                EngineError::Config(format!("max_retry_delay_seconds {}: {}", cap, e))
            })?;
        }
        if self.key_prefix.trim().is_empty() {
            return Err(EngineError::Config("key_prefix must not be empty".to_string()));
        }
        Ok(())
    }

    /// The retry delay cap. A value `validate` would reject yields `None`.
    pub fn max_retry_delay(&self) -> Option<Duration> {
        self.max_retry_delay_seconds
            .and_then(|cap| Duration::try_from_secs_f64(cap).ok())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

/// Open the store the configuration asks for: Redis when `redis_url` is
/// set, in-memory otherwise.
pub async fn open_store(config: &EngineConfig) -> Result<Arc<dyn Store>> {
    match &config.redis_url {
        Some(url) => {
            let store = RedisStore::connect(url, config.key_prefix.clone()).await?;
            Ok(Arc::new(store))
        }
        None => {
            info!("no redis_url configured; using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
