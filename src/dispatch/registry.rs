use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

use crate::core::config::HealthPolicy;
use crate::core::model::NodeId;
use crate::dispatch::node::{Node, NodeHealth, NodeKind};
use crate::scheduler::CapacityProvider;

/// A node moved between health states
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTransition {
    pub node_id: NodeId,
    pub from: NodeHealth,
    pub to: NodeHealth,
}

/// Node table with the health state machine.
///
/// Health only worsens through failures and missed heartbeats; a successful
/// heartbeat or completion is the only way back to Healthy.
pub struct NodeRegistry {
    nodes: RwLock<BTreeMap<NodeId, Node>>,
    policy: HealthPolicy,
}

impl NodeRegistry {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            nodes: RwLock::new(BTreeMap::new()),
            policy,
        }
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    /// Add a node, or refresh kind and capacity of a known one.
    ///
    /// Returns true when the node was not known before.
    pub fn register(&self, node: Node) -> bool {
        let mut nodes = self.nodes.write();
        match nodes.get_mut(&node.id) {
            Some(existing) => {
                existing.kind = node.kind;
                existing.capacity = node.capacity;
                debug!(node_id = %existing.id, capacity = existing.capacity, "Node re-registered");
                false
            }
            None => {
                info!(node_id = %node.id, capacity = node.capacity, kind = ?node.kind, "Node registered");
                nodes.insert(node.id.clone(), node);
                true
            }
        }
    }

    pub fn deregister(&self, node_id: &str) -> Option<Node> {
        let removed = self.nodes.write().remove(node_id);
        if removed.is_some() {
            info!(node_id = %node_id, "Node deregistered");
        }
        removed
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.read().contains_key(node_id)
    }

    pub fn get(&self, node_id: &str) -> Option<Node> {
        self.nodes.read().get(node_id).cloned()
    }

    /// Lowest load ratio among eligible nodes, ties broken by ascending id
    pub fn select_node(&self, exclude: &HashSet<NodeId>) -> Option<NodeId> {
        let nodes = self.nodes.read();
        Self::pick(&nodes, exclude).map(|node| node.id.clone())
    }

    /// Select a node and take one of its slots under the same lock
    pub fn select_and_reserve(&self, exclude: &HashSet<NodeId>) -> Option<NodeId> {
        let mut nodes = self.nodes.write();
        let node_id = Self::pick(&nodes, exclude)?.id.clone();
        let node = nodes.get_mut(&node_id)?;
        node.load += 1;
        debug!(node_id = %node_id, load = node.load, capacity = node.capacity, "Reserved slot");
        Some(node_id)
    }

    fn pick<'a>(nodes: &'a BTreeMap<NodeId, Node>, exclude: &HashSet<NodeId>) -> Option<&'a Node> {
        let mut best: Option<&Node> = None;
        for node in nodes.values() {
            if !node.is_eligible() || exclude.contains(&node.id) {
                continue;
            }
            // Strict comparison keeps the smaller id on ties
            match best {
                Some(current) if node.load_ratio() >= current.load_ratio() => {}
                _ => best = Some(node),
            }
        }
        best
    }

    /// Give back a reserved slot without touching health
    pub fn release(&self, node_id: &str) {
        if let Some(node) = self.nodes.write().get_mut(node_id) {
            node.load = node.load.saturating_sub(1);
        }
    }

    /// A task completed successfully on the node
    pub fn record_success(&self, node_id: &str) -> Option<HealthTransition> {
        let mut nodes = self.nodes.write();
        let node = nodes.get_mut(node_id)?;
        node.load = node.load.saturating_sub(1);
        node.tasks_completed += 1;
        Self::restore(node)
    }

    /// The handler reported failure; the node itself worked fine
    pub fn record_task_failure(&self, node_id: &str) -> Option<HealthTransition> {
        let mut nodes = self.nodes.write();
        let node = nodes.get_mut(node_id)?;
        node.load = node.load.saturating_sub(1);
        node.tasks_failed += 1;
        Self::restore(node)
    }

    /// Transport error or deadline expiry while dispatching to the node
    pub fn record_failure(&self, node_id: &str, now: DateTime<Utc>) -> Option<HealthTransition> {
        let mut nodes = self.nodes.write();
        let node = nodes.get_mut(node_id)?;
        node.load = node.load.saturating_sub(1);
        node.consecutive_failures += 1;
        if node.is_local() {
            // The local pool has no heartbeat to bring it back
            debug!(node_id = %node_id, failures = node.consecutive_failures, "Local dispatch failure");
            return None;
        }
        let target = if node.consecutive_failures >= self.policy.failure_threshold {
            NodeHealth::Unreachable
        } else {
            NodeHealth::Degraded
        };
        Self::degrade(node, target, now)
    }

    pub fn record_missed_heartbeat(
        &self,
        node_id: &str,
        now: DateTime<Utc>,
    ) -> Option<HealthTransition> {
        let mut nodes = self.nodes.write();
        let node = nodes.get_mut(node_id)?;
        if node.is_local() || node.retired {
            return None;
        }
        node.missed_heartbeats += 1;
        let target = if node.missed_heartbeats >= self.policy.missed_heartbeat_threshold {
            NodeHealth::Unreachable
        } else {
            NodeHealth::Degraded
        };
        Self::degrade(node, target, now)
    }

    /// A heartbeat arrived; optionally carries an updated capacity
    pub fn heartbeat(
        &self,
        node_id: &str,
        capacity: Option<usize>,
        now: DateTime<Utc>,
    ) -> Option<HealthTransition> {
        let mut nodes = self.nodes.write();
        let node = nodes.get_mut(node_id)?;
        node.last_heartbeat = Some(now);
        if let Some(capacity) = capacity.filter(|c| *c > 0) {
            node.capacity = capacity;
        }
        Self::restore(node)
    }

    fn restore(node: &mut Node) -> Option<HealthTransition> {
        node.consecutive_failures = 0;
        node.missed_heartbeats = 0;
        node.unreachable_since = None;
        let was_retired = std::mem::replace(&mut node.retired, false);
        if node.health == NodeHealth::Healthy && !was_retired {
            return None;
        }
        let from = node.health;
        node.health = NodeHealth::Healthy;
        info!(node_id = %node.id, from = %from, "Node restored to healthy");
        Some(HealthTransition {
            node_id: node.id.clone(),
            from,
            to: NodeHealth::Healthy,
        })
    }

    fn degrade(node: &mut Node, target: NodeHealth, now: DateTime<Utc>) -> Option<HealthTransition> {
        let from = node.health;
        let to = from.worst(target);
        if to == from {
            return None;
        }
        node.health = to;
        if to == NodeHealth::Unreachable {
            node.unreachable_since = Some(now);
        }
        warn!(
            node_id = %node.id,
            from = %from,
            to = %to,
            failures = node.consecutive_failures,
            missed = node.missed_heartbeats,
            "Node health degraded"
        );
        Some(HealthTransition {
            node_id: node.id.clone(),
            from,
            to,
        })
    }

    /// Retire nodes that stayed Unreachable past the grace period
    pub fn retire_expired(&self, now: DateTime<Utc>) -> Vec<NodeId> {
        let grace = chrono::Duration::from_std(self.policy.unreachable_grace)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let mut retired = Vec::new();
        for node in self.nodes.write().values_mut() {
            if node.retired || node.health != NodeHealth::Unreachable {
                continue;
            }
            let expired = node
                .unreachable_since
                .map(|since| now - since >= grace)
                .unwrap_or(false);
            if expired {
                node.retired = true;
                warn!(node_id = %node.id, "Retiring node unreachable past grace period");
                retired.push(node.id.clone());
            }
        }
        retired
    }

    /// Remote, non-retired nodes with their base URLs
    pub fn probe_targets(&self) -> Vec<(NodeId, String)> {
        self.nodes
            .read()
            .values()
            .filter(|node| !node.retired)
            .filter_map(|node| match &node.kind {
                NodeKind::Remote { base_url } => Some((node.id.clone(), base_url.clone())),
                NodeKind::Local => None,
            })
            .collect()
    }

    pub fn snapshot(&self) -> Vec<Node> {
        self.nodes.read().values().cloned().collect()
    }
}

impl CapacityProvider for NodeRegistry {
    fn healthy_capacity(&self) -> usize {
        self.nodes
            .read()
            .values()
            .filter(|node| node.health == NodeHealth::Healthy && !node.retired)
            .map(|node| node.capacity)
            .sum()
    }

    fn global_load(&self) -> usize {
        self.nodes.read().values().map(|node| node.load).sum()
    }
}
