use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::cache::CacheCoordinator;
use crate::core::errors::{EngineError, Result};
use crate::core::model::{TaskId, TaskState};
use crate::dispatch::node::{NodeConfig, NodeHealth};
use crate::handler::{HandlerRegistry, TaskContext};
use crate::node::protocol::{
    CancelResponse, ExecuteRequest, ExecuteResponse, HealthResponse, NodeStatsResponse,
    TaskStatusResponse,
};

struct TaskRecord {
    state: TaskState,
    result: Option<Value>,
    error: Option<String>,
    handle: Option<AbortHandle>,
    finished_at: Option<Instant>,
}

impl TaskRecord {
    fn status(&self) -> TaskStatusResponse {
        TaskStatusResponse {
            state: self.state,
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }
}

/// How long a finished task's status stays queryable
pub const DEFAULT_RESULT_RETENTION: Duration = Duration::from_secs(300);

/// Worker-side state behind the node HTTP surface
pub struct NodeServer {
    config: NodeConfig,
    retention: Duration,
    handlers: Arc<HandlerRegistry>,
    permits: Arc<Semaphore>,
    tasks: DashMap<TaskId, TaskRecord>,
    completed: AtomicU64,
    failed: AtomicU64,
    cache: Option<Arc<CacheCoordinator>>,
}

impl NodeServer {
    pub fn new(config: NodeConfig, handlers: HandlerRegistry) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_workers)),
            config,
            retention: DEFAULT_RESULT_RETENTION,
            handlers: Arc::new(handlers),
            tasks: DashMap::new(),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            cache: None,
        }
    }

    /// Give handlers read/write access to a store through this cache
    pub fn with_cache(mut self, cache: Arc<CacheCoordinator>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Keep terminal task records for `retention` before dropping them
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn load(&self) -> usize {
        self.config
            .max_workers
            .saturating_sub(self.permits.available_permits())
    }

    fn health(&self) -> HealthResponse {
        HealthResponse {
            status: NodeHealth::Healthy,
            load: self.load(),
            capacity: self.config.max_workers,
        }
    }

    /// Number of task records currently held, finished ones included
    pub fn tracked_tasks(&self) -> usize {
        self.tasks.len()
    }

    fn prune_finished(&self) {
        let retention = self.retention;
        let before = self.tasks.len();
        self.tasks.retain(|_, record| {
            record
                .finished_at
                .map(|at| at.elapsed() < retention)
                .unwrap_or(true)
        });
        let evicted = before.saturating_sub(self.tasks.len());
        if evicted > 0 {
            debug!(evicted, "Dropped expired task records");
        }
    }

    /// Accept a task and run it once a worker slot frees up
    fn accept(self: &Arc<Self>, request: ExecuteRequest) -> ExecuteResponse {
        self.prune_finished();
        let task_id = request.task_id.clone();
        let reject = |reason: String| ExecuteResponse {
            accepted: false,
            task_id: task_id.clone(),
            reason: Some(reason),
        };

        let Some(handler) = self.handlers.get(&request.task_type) else {
            return reject(format!("no handler for task type {}", request.task_type));
        };
        if let Some(existing) = self.tasks.get(&task_id) {
            if !existing.state.is_terminal() {
                return reject("task is already running on this node".to_string());
            }
        }
        self.tasks.insert(
            task_id.clone(),
            TaskRecord {
                state: TaskState::Ready,
                result: None,
                error: None,
                handle: None,
                finished_at: None,
            },
        );

        let timeout = Duration::from_secs(request.timeout.unwrap_or(self.config.task_timeout));
        let mut ctx = TaskContext::new(task_id.clone(), request.task_type.clone(), request.task_data);
        if let Some(kind) = request.kind {
            ctx = ctx.with_kind(kind);
        }
        if let Some(cache) = &self.cache {
            ctx = ctx.with_cache(cache.clone());
        }

        let server = self.clone();
        let id = task_id.clone();
        let handle = tokio::spawn(async move {
            let Ok(_permit) = server.permits.clone().acquire_owned().await else {
                return;
            };
            server.set_state(&id, TaskState::Running);
            let result = match tokio::time::timeout(timeout, handler.execute(ctx)).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(format!("{:#}", e)),
                Err(_) => Err(format!("task timed out after {}s", timeout.as_secs())),
            };
            server.finish(&id, result);
        });
        if let Some(mut record) = self.tasks.get_mut(&task_id) {
            record.handle = Some(handle.abort_handle());
        }

        info!(task_id = %task_id, task_type = %request.task_type, "Task accepted");
        ExecuteResponse {
            accepted: true,
            task_id,
            reason: None,
        }
    }

    fn set_state(&self, task_id: &str, state: TaskState) {
        if let Some(mut record) = self.tasks.get_mut(task_id) {
            if !record.state.is_terminal() {
                record.state = state;
            }
        }
    }

    fn finish(&self, task_id: &str, result: std::result::Result<Value, String>) {
        let Some(mut record) = self.tasks.get_mut(task_id) else {
            return;
        };
        if record.state.is_terminal() {
            return;
        }
        record.handle = None;
        record.finished_at = Some(Instant::now());
        match result {
            Ok(value) => {
                record.state = TaskState::Succeeded;
                record.result = Some(value);
                self.completed.fetch_add(1, Ordering::Relaxed);
                debug!(task_id = %task_id, "Task succeeded");
            }
            Err(error) => {
                warn!(task_id = %task_id, error = %error, "Task failed");
                record.state = TaskState::Failed;
                record.error = Some(error);
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn cancel(&self, task_id: &str) -> bool {
        let Some(mut record) = self.tasks.get_mut(task_id) else {
            return false;
        };
        if record.state.is_terminal() {
            return false;
        }
        if let Some(handle) = record.handle.take() {
            handle.abort();
        }
        record.state = TaskState::Cancelled;
        record.finished_at = Some(Instant::now());
        info!(task_id = %task_id, "Task cancelled");
        true
    }
}

pub fn build_router(server: Arc<NodeServer>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/task/execute", post(execute_task))
        .route("/api/v1/task/:task_id/status", get(task_status))
        .route("/api/v1/task/:task_id/cancel", post(cancel_task))
        .route("/api/v1/node/stats", get(node_stats))
        .with_state(server)
}

async fn health(State(server): State<Arc<NodeServer>>) -> Json<HealthResponse> {
    Json(server.health())
}

async fn execute_task(
    State(server): State<Arc<NodeServer>>,
    Json(request): Json<ExecuteRequest>,
) -> Json<ExecuteResponse> {
    Json(server.accept(request))
}

async fn task_status(
    State(server): State<Arc<NodeServer>>,
    Path(task_id): Path<String>,
) -> std::result::Result<Json<TaskStatusResponse>, StatusCode> {
    server
        .tasks
        .get(&task_id)
        .map(|record| Json(record.status()))
        .ok_or(StatusCode::NOT_FOUND)
}

async fn cancel_task(
    State(server): State<Arc<NodeServer>>,
    Path(task_id): Path<String>,
) -> Json<CancelResponse> {
    Json(CancelResponse {
        cancelled: server.cancel(&task_id),
    })
}

async fn node_stats(State(server): State<Arc<NodeServer>>) -> Json<NodeStatsResponse> {
    Json(NodeStatsResponse {
        load: server.load(),
        capacity: server.config.max_workers,
        health: NodeHealth::Healthy,
        completed: server.completed.load(Ordering::Relaxed),
        failed: server.failed.load(Ordering::Relaxed),
    })
}

/// Serve the node API on `config.host:config.port` until `shutdown` resolves
pub async fn serve<F>(server: NodeServer, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", server.config.host, server.config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| EngineError::io(format!("bind {}", addr), e))?;
    info!(node_id = %server.config.node_id, addr = %addr, "Node listening");

    let app = build_router(Arc::new(server));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| EngineError::io("serve node api", e))
}
