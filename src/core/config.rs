use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::errors::{EngineError, Result};
use crate::dispatch::node::NodeConfig;

/// Order among Ready tasks of equal priority
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Earliest Ready promotion first
    #[default]
    Fifo,
    /// Latest Ready promotion first
    Lifo,
}

/// Ready-queue and dispatch-loop tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of tasks held in the ready queue
    pub queue_capacity: usize,
    /// Maximum tasks pulled per dispatch-loop iteration
    pub dispatch_batch: usize,
    /// Fallback wake-up interval for the dispatch loop (ms in config files)
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    pub tie_break: TieBreak,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            dispatch_batch: 64,
            poll_interval: Duration::from_millis(100),
            tie_break: TieBreak::Fifo,
        }
    }
}

/// Cross-node retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Dispatch attempts across nodes before a task is failed
    pub max_attempts: u32,
    /// Deadline applied when a task carries no timeout of its own
    #[serde(with = "duration_ms")]
    pub default_task_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            default_task_timeout: Duration::from_secs(300),
        }
    }
}

/// Node health state machine thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthPolicy {
    /// Consecutive dispatch failures before a node becomes Unreachable
    pub failure_threshold: u32,
    /// Consecutive missed heartbeats before a node becomes Unreachable
    pub missed_heartbeat_threshold: u32,
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// A probe not answered within this window counts as a miss
    #[serde(with = "duration_ms")]
    pub heartbeat_timeout: Duration,
    /// How long a node may stay Unreachable before it is retired
    #[serde(with = "duration_ms")]
    pub unreachable_grace: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            missed_heartbeat_threshold: 3,
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(2),
            unreachable_grace: Duration::from_secs(60),
        }
    }
}

/// Two-tier cache sizing and adaptive resize policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub primary_capacity: usize,
    pub secondary_capacity: usize,
    /// Upper bound Primary may grow to through adaptive resizing
    pub max_primary_capacity: usize,
    /// Lower bound Secondary may shrink to through adaptive resizing
    pub min_secondary_capacity: usize,
    /// Entries moved from Secondary to Primary per resize
    pub resize_step: usize,
    /// Secondary hit rate below which Secondary is shrunk
    pub secondary_hit_rate_threshold: f64,
    /// Secondary lookups per measurement window
    pub measurement_window: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            primary_capacity: 1_024,
            secondary_capacity: 8_192,
            max_primary_capacity: 4_096,
            min_secondary_capacity: 1_024,
            resize_step: 256,
            secondary_hit_rate_threshold: 0.2,
            measurement_window: 1_000,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.primary_capacity == 0 {
            return Err(EngineError::configuration("primary_capacity cannot be zero"));
        }
        if self.max_primary_capacity < self.primary_capacity {
            return Err(EngineError::configuration(
                "max_primary_capacity must be >= primary_capacity",
            ));
        }
        if self.min_secondary_capacity > self.secondary_capacity {
            return Err(EngineError::configuration(
                "min_secondary_capacity must be <= secondary_capacity",
            ));
        }
        if !(0.0..=1.0).contains(&self.secondary_hit_rate_threshold) {
            return Err(EngineError::configuration(
                "secondary_hit_rate_threshold must be between 0.0 and 1.0",
            ));
        }
        if self.measurement_window == 0 {
            return Err(EngineError::configuration("measurement_window cannot be zero"));
        }
        Ok(())
    }
}

/// Connection pool over the backing store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Location of the embedded database for this dataset
    pub store_path: PathBuf,
    /// Connections requested at initialization
    pub target_size: usize,
    #[serde(with = "duration_ms")]
    pub acquire_timeout: Duration,
    /// Appended to the store path when a corrupted store is moved aside
    pub backup_suffix: String,
    /// Keyspace inside the store used for cache persistence
    pub tree_name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("import-store.db"),
            target_size: 4,
            acquire_timeout: Duration::from_secs(5),
            backup_suffix: "corrupt".to_string(),
            tree_name: "cache".to_string(),
        }
    }
}

/// Engine configuration with all tuning parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub local_node_id: String,
    /// Size of the local worker pool; 0 disables local execution
    pub local_workers: usize,
    pub scheduler: SchedulerConfig,
    pub dispatch: DispatchConfig,
    pub health: HealthPolicy,
    pub cache: CacheConfig,
    pub pool: PoolConfig,
    /// Remote nodes registered at startup
    pub remote_nodes: Vec<NodeConfig>,
    /// Write each finished task record through the cache before promoting dependents
    pub persist_task_records: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            local_node_id: "local".to_string(),
            local_workers: 4,
            scheduler: SchedulerConfig::default(),
            dispatch: DispatchConfig::default(),
            health: HealthPolicy::default(),
            cache: CacheConfig::default(),
            pool: PoolConfig::default(),
            remote_nodes: Vec::new(),
            persist_task_records: true,
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    pub fn from_yaml_str(source: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| EngineError::io(format!("read config {}", path.display()), e))?;
        Self::from_yaml_str(&source)
    }

    pub fn validate(&self) -> Result<()> {
        if self.local_workers == 0 && self.remote_nodes.is_empty() {
            return Err(EngineError::configuration(
                "at least one local worker or remote node is required",
            ));
        }
        if self.scheduler.queue_capacity == 0 {
            return Err(EngineError::configuration("queue_capacity must be greater than 0"));
        }
        if self.scheduler.dispatch_batch == 0 {
            return Err(EngineError::configuration("dispatch_batch must be greater than 0"));
        }
        if self.dispatch.max_attempts == 0 {
            return Err(EngineError::configuration("max_attempts must be greater than 0"));
        }
        if self.health.failure_threshold == 0 || self.health.missed_heartbeat_threshold == 0 {
            return Err(EngineError::configuration(
                "health thresholds must be greater than 0",
            ));
        }
        if self.health.heartbeat_timeout > self.health.heartbeat_interval {
            return Err(EngineError::configuration(
                "heartbeat_timeout cannot exceed heartbeat_interval",
            ));
        }
        if self.pool.target_size == 0 {
            return Err(EngineError::configuration("pool target_size must be greater than 0"));
        }
        for node in &self.remote_nodes {
            node.validate()?;
        }
        self.cache.validate()
    }

    /// Create a configuration tuned for development/testing
    pub fn development() -> Self {
        Self {
            local_workers: 2,
            scheduler: SchedulerConfig {
                queue_capacity: 1_000,
                dispatch_batch: 16,
                poll_interval: Duration::from_millis(20),
                ..Default::default()
            },
            dispatch: DispatchConfig {
                max_attempts: 3,
                default_task_timeout: Duration::from_secs(10),
            },
            health: HealthPolicy {
                heartbeat_interval: Duration::from_millis(500),
                heartbeat_timeout: Duration::from_millis(250),
                unreachable_grace: Duration::from_secs(5),
                ..Default::default()
            },
            cache: CacheConfig {
                primary_capacity: 64,
                secondary_capacity: 256,
                max_primary_capacity: 192,
                min_secondary_capacity: 64,
                resize_step: 32,
                measurement_window: 100,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Builder for EngineConfig
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn local_workers(mut self, workers: usize) -> Self {
        self.config.local_workers = workers;
        self
    }

    pub fn store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pool.store_path = path.into();
        self
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.config.pool.target_size = size;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.dispatch.max_attempts = attempts;
        self
    }

    pub fn default_task_timeout(mut self, timeout: Duration) -> Self {
        self.config.dispatch.default_task_timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.scheduler.poll_interval = interval;
        self
    }

    pub fn health(mut self, policy: HealthPolicy) -> Self {
        self.config.health = policy;
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.config.cache = cache;
        self
    }

    pub fn remote_node(mut self, node: NodeConfig) -> Self {
        self.config.remote_nodes.push(node);
        self
    }

    pub fn persist_task_records(mut self, enabled: bool) -> Self {
        self.config.persist_task_records = enabled;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// Durations are written as whole milliseconds in config files
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_development_config() {
        let config = EngineConfig::development();
        assert!(config.validate().is_ok());
        assert_eq!(config.local_workers, 2);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = EngineConfig::default();

        config.dispatch.max_attempts = 0;
        assert!(config.validate().is_err());
        config.dispatch.max_attempts = 3;

        config.local_workers = 0;
        assert!(config.validate().is_err());
        config.local_workers = 1;

        config.cache.secondary_hit_rate_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::builder()
            .local_workers(8)
            .store_path("/tmp/quotes.db")
            .pool_size(6)
            .max_attempts(5)
            .build()
            .unwrap();

        assert_eq!(config.local_workers, 8);
        assert_eq!(config.pool.target_size, 6);
        assert_eq!(config.dispatch.max_attempts, 5);
        assert_eq!(config.pool.store_path, PathBuf::from("/tmp/quotes.db"));
    }

    #[test]
    fn test_yaml_partial_config() {
        let yaml = r#"
local_workers: 3
scheduler:
  poll_interval: 25
health:
  failure_threshold: 2
  heartbeat_interval: 1000
  heartbeat_timeout: 500
remote_nodes:
  - node_id: gpu-1
    host: 10.0.0.7
    port: 9400
    max_workers: 8
"#;
        let config = EngineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.local_workers, 3);
        assert_eq!(config.scheduler.poll_interval, Duration::from_millis(25));
        assert_eq!(config.scheduler.queue_capacity, 10_000);
        assert_eq!(config.health.failure_threshold, 2);
        assert_eq!(config.remote_nodes.len(), 1);
        assert_eq!(config.remote_nodes[0].max_workers, 8);
    }
}
