//! Task handlers: the code that actually runs on a node.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::cache::CacheCoordinator;
use crate::core::errors::{EngineError, Result};
use crate::core::model::{TaskId, TaskKind};

/// Handler trait for task execution
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Run the task. An `Err` is a task failure, not a node failure.
    async fn execute(&self, ctx: TaskContext) -> anyhow::Result<Value>;
}

/// Task execution context
#[derive(Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub task_type: String,
    /// Present when the task came from this engine rather than over the wire
    pub kind: Option<TaskKind>,
    pub data: Value,
    cache: Option<Arc<CacheCoordinator>>,
}

impl TaskContext {
    pub fn new(task_id: impl Into<TaskId>, task_type: impl Into<String>, data: Value) -> Self {
        Self {
            task_id: task_id.into(),
            task_type: task_type.into(),
            kind: None,
            data,
            cache: None,
        }
    }

    pub fn with_kind(mut self, kind: TaskKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_cache(mut self, cache: Arc<CacheCoordinator>) -> Self {
        self.cache = Some(cache);
        self
    }

    fn cache(&self) -> Result<&CacheCoordinator> {
        self.cache
            .as_deref()
            .ok_or_else(|| EngineError::internal("no cache attached to this node"))
    }

    /// Read through the node's cache
    pub async fn read(&self, key: &str) -> Result<Option<Value>> {
        self.cache()?.get(key).await
    }

    /// Write through the node's cache to the store
    pub async fn write(&self, key: &str, value: Value) -> Result<()> {
        self.cache()?.put(key, value).await
    }
}

/// Adapts an async closure into a [`TaskHandler`]
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn execute(&self, ctx: TaskContext) -> anyhow::Result<Value> {
        (self.0)(ctx).await
    }
}

/// Handlers keyed by task type
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) -> &mut Self {
        self.handlers.insert(task_type.into(), handler);
        self
    }

    pub fn register_fn<F, Fut>(&mut self, task_type: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register(task_type, Arc::new(FnHandler(f)))
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fn_handler_runs() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("double", |ctx: TaskContext| async move {
            let n = ctx.data["n"].as_i64().unwrap_or_default();
            Ok(json!(n * 2))
        });

        let handler = registry.get("double").unwrap();
        let out = handler
            .execute(TaskContext::new("t1", "double", json!({"n": 21})))
            .await
            .unwrap();
        assert_eq!(out, json!(42));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.task_types(), vec!["double"]);
    }

    #[tokio::test]
    async fn test_context_without_cache_errors() {
        let ctx = TaskContext::new("t1", "import", Value::Null);
        assert!(ctx.read("k").await.is_err());
    }
}
