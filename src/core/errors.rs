use std::path::PathBuf;
use thiserror::Error;

use crate::core::model::{NodeId, TaskId};

/// Unified error type for the orchestration engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Submission would close a cycle in the dependency graph
    #[error("Dependency conflict: submitting {task_id} closes cycle {}", .cycle.join(" -> "))]
    DependencyConflict { task_id: TaskId, cycle: Vec<TaskId> },

    /// A dependency id is neither known nor part of the same batch
    #[error("Task {task_id} depends on unknown task {dependency}")]
    UnknownDependency { task_id: TaskId, dependency: TaskId },

    #[error("Task already submitted: {0}")]
    DuplicateTask(TaskId),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    /// No healthy node could accept the task; the caller should back off
    #[error("No healthy node available for task {task_id}")]
    NodeUnavailable { task_id: TaskId },

    /// Bounded cross-node retries ran out
    #[error("Dispatch exhausted for task {task_id} after {attempts} attempts: {last_error}")]
    DispatchExhausted {
        task_id: TaskId,
        attempts: u32,
        last_error: String,
    },

    #[error("Transport error on node {node_id}: {message}")]
    Transport { node_id: NodeId, message: String },

    #[error("Task {task_id} timed out on node {node_id} after {timeout_ms}ms")]
    Timeout {
        task_id: TaskId,
        node_id: NodeId,
        timeout_ms: u64,
    },

    #[error("Ready queue full: capacity {capacity} reached")]
    QueueFull { capacity: usize },

    /// Backing store content is unreadable or malformed
    #[error("Corrupted store at {}: {message}", .path.display())]
    CorruptedStore { path: PathBuf, message: String },

    #[error("Connection pool exhausted: {reason}")]
    PoolExhausted { reason: String },

    #[error("Database operation failed: {operation}")]
    Database {
        operation: String,
        #[source]
        source: sled::Error,
    },

    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Task cancelled: {task_id}")]
    Cancelled { task_id: TaskId },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl EngineError {
    pub fn transport<N: Into<String>, M: Into<String>>(node_id: N, message: M) -> Self {
        Self::Transport {
            node_id: node_id.into(),
            message: message.into(),
        }
    }

    pub fn corrupted<M: Into<String>>(path: impl Into<PathBuf>, message: M) -> Self {
        Self::CorruptedStore {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn pool_exhausted<S: Into<String>>(reason: S) -> Self {
        Self::PoolExhausted {
            reason: reason.into(),
        }
    }

    pub fn database<S: Into<String>>(operation: S, source: sled::Error) -> Self {
        Self::Database {
            operation: operation.into(),
            source,
        }
    }

    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Errors that should trigger failover to another node rather than fail the task
    pub fn is_failover(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout { .. })
    }

    /// Check if error is recoverable by waiting or retrying elsewhere
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::NodeUnavailable { .. }
            | Self::Transport { .. }
            | Self::Timeout { .. }
            | Self::QueueFull { .. }
            | Self::PoolExhausted { .. }
            | Self::Io { .. }
            | Self::Database { .. } => true,
            Self::DependencyConflict { .. }
            | Self::UnknownDependency { .. }
            | Self::DuplicateTask(_)
            | Self::DispatchExhausted { .. }
            | Self::Configuration { .. }
            | Self::Cancelled { .. } => false,
            _ => false,
        }
    }

    /// Get error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::DependencyConflict { .. } | Self::UnknownDependency { .. } => "dependency",
            Self::DuplicateTask(_) | Self::TaskNotFound(_) | Self::Cancelled { .. } => "task",
            Self::NodeUnavailable { .. } | Self::DispatchExhausted { .. } => "dispatch",
            Self::Transport { .. } => "transport",
            Self::Timeout { .. } => "timeout",
            Self::QueueFull { .. } => "scheduler",
            Self::CorruptedStore { .. } | Self::PoolExhausted { .. } => "pool",
            Self::Database { .. } => "database",
            Self::Io { .. } => "io",
            Self::Serialization { .. } => "serialization",
            Self::Configuration { .. } => "configuration",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<sled::Error> for EngineError {
    fn from(err: sled::Error) -> Self {
        Self::database("sled_operation", err)
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        let node = err
            .url()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        if err.is_timeout() {
            Self::transport(node, format!("request timed out: {}", err))
        } else {
            Self::transport(node, err.to_string())
        }
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string())
    }
}
