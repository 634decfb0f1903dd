// Shared types used by every component of the engine

pub mod config;
pub mod errors;
pub mod model;
pub mod telemetry;

// Re-export commonly used types
pub use config::{
    CacheConfig, DispatchConfig, EngineConfig, EngineConfigBuilder, HealthPolicy, PoolConfig,
    SchedulerConfig, TieBreak,
};
pub use errors::{EngineError, Result};
pub use model::{NodeId, Task, TaskId, TaskKind, TaskOutcome, TaskSpec, TaskState};
pub use telemetry::init_tracing;
