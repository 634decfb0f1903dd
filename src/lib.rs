//! Orchestration core for a data-import subsystem.
//!
//! Tasks are submitted as a dependency graph, released by priority once their
//! dependencies succeed, and dispatched to local or remote worker nodes with
//! health-aware failover. Handlers read and write through a two-tier adaptive
//! cache backed by a pooled sled store.

// Shared infrastructure
pub mod core;
pub mod handler;

// Engine components, leaves first
pub mod storage;
pub mod cache;
pub mod resolver;
pub mod scheduler;
pub mod dispatch;
pub mod coordinator;

// Remote worker surface
pub mod node;

// Re-exports for convenience
pub use crate::core::config::{
    CacheConfig, DispatchConfig, EngineConfig, EngineConfigBuilder, HealthPolicy, PoolConfig,
    SchedulerConfig,
};
pub use crate::core::errors::{EngineError, Result};
pub use crate::core::model::{NodeId, Task, TaskId, TaskKind, TaskOutcome, TaskSpec, TaskState};
pub use crate::core::telemetry::init_tracing;
pub use cache::{CacheCoordinator, CacheMetrics, Tier};
pub use coordinator::{
    CoordinatorParts, EngineEvent, EngineStats, ExecutionCoordinator, PriorityScorer,
    Subscription,
};
pub use dispatch::{NodeConfig, NodeHealth, NodeTransport};
pub use handler::{HandlerRegistry, TaskContext, TaskHandler};
pub use storage::{ConnectionPoolManager, PoolState};
