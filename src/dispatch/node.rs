use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::{EngineError, Result};
use crate::core::model::NodeId;

/// Node health as seen by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeHealth {
    Healthy,
    Degraded,
    Unreachable,
}

impl NodeHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeHealth::Healthy => "healthy",
            NodeHealth::Degraded => "degraded",
            NodeHealth::Unreachable => "unreachable",
        }
    }

    // Healthy < Degraded < Unreachable
    fn rank(&self) -> u8 {
        match self {
            NodeHealth::Healthy => 0,
            NodeHealth::Degraded => 1,
            NodeHealth::Unreachable => 2,
        }
    }

    /// The worse of the two states
    pub(crate) fn worst(self, other: NodeHealth) -> NodeHealth {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

impl std::fmt::Display for NodeHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    /// In-process worker pool
    Local,
    /// Worker process reached over HTTP
    Remote { base_url: String },
}

/// Registration parameters for a remote node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Seconds a task may run on this node before it is treated as lost
    #[serde(default = "default_task_timeout")]
    pub task_timeout: u64,
    /// Seconds between heartbeats the node promises to answer
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    #[serde(default)]
    pub max_memory_mb: Option<u64>,
    #[serde(default)]
    pub max_cpu_percent: Option<f32>,
}

fn default_max_workers() -> usize {
    4
}

fn default_task_timeout() -> u64 {
    300
}

fn default_heartbeat_interval() -> u64 {
    5
}

impl NodeConfig {
    pub fn new(node_id: impl Into<NodeId>, host: impl Into<String>, port: u16) -> Self {
        Self {
            node_id: node_id.into(),
            host: host.into(),
            port,
            max_workers: default_max_workers(),
            task_timeout: default_task_timeout(),
            heartbeat_interval: default_heartbeat_interval(),
            max_memory_mb: None,
            max_cpu_percent: None,
        }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(EngineError::configuration("node_id cannot be empty"));
        }
        if self.host.is_empty() {
            return Err(EngineError::configuration(format!(
                "node {} has an empty host",
                self.node_id
            )));
        }
        if self.max_workers == 0 {
            return Err(EngineError::configuration(format!(
                "node {} must allow at least one worker",
                self.node_id
            )));
        }
        if let Some(cpu) = self.max_cpu_percent {
            if !(0.0..=100.0).contains(&cpu) {
                return Err(EngineError::configuration(format!(
                    "node {} max_cpu_percent must be between 0 and 100",
                    self.node_id
                )));
            }
        }
        Ok(())
    }
}

/// Registry record for one worker node
#[derive(Debug, Clone, Serialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub capacity: usize,
    pub load: usize,
    pub health: NodeHealth,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub missed_heartbeats: u32,
    pub unreachable_since: Option<DateTime<Utc>>,
    /// Unreachable past the grace period; no longer probed or selected
    pub retired: bool,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
}

impl Node {
    pub fn local(id: impl Into<NodeId>, capacity: usize) -> Self {
        Self::new(id.into(), NodeKind::Local, capacity)
    }

    pub fn from_config(config: &NodeConfig) -> Self {
        Self::new(
            config.node_id.clone(),
            NodeKind::Remote {
                base_url: config.base_url(),
            },
            config.max_workers,
        )
    }

    fn new(id: NodeId, kind: NodeKind, capacity: usize) -> Self {
        Self {
            id,
            kind,
            capacity,
            load: 0,
            health: NodeHealth::Healthy,
            last_heartbeat: None,
            consecutive_failures: 0,
            missed_heartbeats: 0,
            unreachable_since: None,
            retired: false,
            tasks_completed: 0,
            tasks_failed: 0,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self.kind, NodeKind::Local)
    }

    /// Healthy, not retired, and with a free slot
    pub fn is_eligible(&self) -> bool {
        self.health == NodeHealth::Healthy && !self.retired && self.load < self.capacity
    }

    pub fn load_ratio(&self) -> f64 {
        if self.capacity == 0 {
            return f64::INFINITY;
        }
        self.load as f64 / self.capacity as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_config_defaults_from_yaml() {
        let config: NodeConfig =
            serde_yaml::from_str("node_id: edge-1\nhost: 10.1.0.4\nport: 9400\n").unwrap();
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.task_timeout, 300);
        assert!(config.validate().is_ok());
        assert_eq!(config.base_url(), "http://10.1.0.4:9400");
    }

    #[test]
    fn test_node_config_validation() {
        assert!(NodeConfig::new("", "h", 1).validate().is_err());
        assert!(NodeConfig::new("n", "h", 1)
            .with_max_workers(0)
            .validate()
            .is_err());
        let mut config = NodeConfig::new("n", "h", 1);
        config.max_cpu_percent = Some(140.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_eligibility_and_ratio() {
        let mut node = Node::local("local", 2);
        assert!(node.is_eligible());
        node.load = 2;
        assert!(!node.is_eligible());
        assert_eq!(node.load_ratio(), 1.0);

        node.load = 0;
        node.health = NodeHealth::Degraded;
        assert!(!node.is_eligible());
    }

    #[test]
    fn test_worst_health() {
        assert_eq!(
            NodeHealth::Degraded.worst(NodeHealth::Unreachable),
            NodeHealth::Unreachable
        );
        assert_eq!(
            NodeHealth::Degraded.worst(NodeHealth::Healthy),
            NodeHealth::Degraded
        );
    }
}
