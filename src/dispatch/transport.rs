use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::cache::CacheCoordinator;
use crate::core::errors::{EngineError, Result};
use crate::core::model::{NodeId, TaskId, TaskOutcome};
use crate::dispatch::node::NodeHealth;
use crate::handler::{HandlerRegistry, TaskContext};
use crate::node::protocol::{ExecuteRequest, HealthResponse};

/// How the dispatcher talks to a node.
///
/// `execute` returns `Err` only for transport-level failures; a handler that
/// fails produces `Ok(TaskOutcome::Failure)`.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    async fn execute(&self, request: ExecuteRequest) -> Result<TaskOutcome>;

    async fn health(&self) -> Result<HealthResponse>;

    /// Best-effort interrupt of a running task
    async fn cancel(&self, task_id: &str) -> Result<bool>;
}

/// Tracks a spawned handler; aborts it if the awaiting future is dropped
struct RunningGuard<'a> {
    running: &'a DashMap<TaskId, AbortHandle>,
    task_id: TaskId,
    handle: AbortHandle,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.handle.abort();
        self.running.remove(&self.task_id);
    }
}

/// In-process worker pool bounded by a semaphore
pub struct LocalTransport {
    node_id: NodeId,
    capacity: usize,
    handlers: Arc<HandlerRegistry>,
    permits: Arc<Semaphore>,
    running: DashMap<TaskId, AbortHandle>,
    cache: Option<Arc<CacheCoordinator>>,
}

impl LocalTransport {
    pub fn new(node_id: impl Into<NodeId>, workers: usize, handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            node_id: node_id.into(),
            capacity: workers,
            handlers,
            permits: Arc::new(Semaphore::new(workers)),
            running: DashMap::new(),
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<CacheCoordinator>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn running(&self) -> usize {
        self.running.len()
    }
}

#[async_trait]
impl NodeTransport for LocalTransport {
    async fn execute(&self, request: ExecuteRequest) -> Result<TaskOutcome> {
        let Some(handler) = self.handlers.get(&request.task_type) else {
            return Ok(TaskOutcome::Failure(format!(
                "no handler registered for task type '{}'",
                request.task_type
            )));
        };

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::transport(&self.node_id, "worker pool closed"))?;

        let task_id = request.task_id.clone();
        let mut ctx = TaskContext::new(request.task_id, request.task_type, request.task_data);
        if let Some(kind) = request.kind {
            ctx = ctx.with_kind(kind);
        }
        if let Some(cache) = &self.cache {
            ctx = ctx.with_cache(cache.clone());
        }

        let handle = tokio::spawn(async move {
            let _permit = permit;
            handler.execute(ctx).await
        });
        self.running.insert(task_id.clone(), handle.abort_handle());
        let guard = RunningGuard {
            running: &self.running,
            task_id: task_id.clone(),
            handle: handle.abort_handle(),
        };
        debug!(node_id = %self.node_id, task_id = %task_id, "Running task locally");

        let joined = handle.await;
        drop(guard);

        match joined {
            Ok(Ok(value)) => Ok(TaskOutcome::Success(value)),
            Ok(Err(e)) => Ok(TaskOutcome::Failure(format!("{:#}", e))),
            Err(join) if join.is_cancelled() => Err(EngineError::Cancelled { task_id }),
            Err(join) => {
                warn!(node_id = %self.node_id, task_id = %task_id, "Handler panicked");
                Ok(TaskOutcome::Failure(format!("handler panicked: {}", join)))
            }
        }
    }

    async fn health(&self) -> Result<HealthResponse> {
        Ok(HealthResponse {
            status: NodeHealth::Healthy,
            load: self.running.len(),
            capacity: self.capacity,
        })
    }

    async fn cancel(&self, task_id: &str) -> Result<bool> {
        match self.running.remove(task_id) {
            Some((_, handle)) => {
                handle.abort();
                debug!(node_id = %self.node_id, task_id = %task_id, "Aborted local task");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
