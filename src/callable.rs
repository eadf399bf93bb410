use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::task::Metadata;

pub type CallableError = Box<dyn std::error::Error + Send + Sync>;
pub type CallableResult = Result<serde_json::Value, CallableError>;

type BlockingFn = dyn Fn(Metadata) -> CallableResult + Send + Sync;
type AsyncFn = dyn Fn(Metadata) -> BoxFuture<'static, CallableResult> + Send + Sync;

/// A registered unit of in-process work. Both kinds receive the task's
/// metadata and return a JSON value.
#[derive(Clone)]
pub enum Callable {
    /// Runs on the blocking thread pool. A timed-out blocking callable is
    /// abandoned, not interrupted.
    Blocking(Arc<BlockingFn>),
    /// Runs on the async runtime and is dropped on timeout or cancellation.
    Async(Arc<AsyncFn>),
}

/// Name → callable lookup used by tasks declared with `callable = "<name>"`.
#[derive(Default)]
pub struct CallableRegistry {
    entries: RwLock<HashMap<String, Callable>>,
}

impl CallableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_blocking<F>(&self, name: impl Into<String>, f: F) -> &Self
    where
        F: Fn(Metadata) -> CallableResult + Send + Sync + 'static,
    {
        self.insert(name.into(), Callable::Blocking(Arc::new(f)))
    }

    pub fn register_async<F, Fut>(&self, name: impl Into<String>, f: F) -> &Self
    where
        F: Fn(Metadata) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallableResult> + Send + 'static,
    {
        self.insert(
            name.into(),
            Callable::Async(Arc::new(move |metadata| f(metadata).boxed())),
        )
    }

    fn insert(&self, name: String, callable: Callable) -> &Self {
        // A poisoned lock only means a registration panicked; the map is intact.
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(name, callable);
        self
    }

    pub fn get(&self, name: &str) -> Option<Callable> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}
