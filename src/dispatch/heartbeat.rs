use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::core::errors::EngineError;
use crate::dispatch::dispatcher::Dispatcher;
use crate::dispatch::node::NodeHealth;
use crate::scheduler::Scheduler;

/// Outcome of one probe round
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub probed: usize,
    pub answered: usize,
    pub restored: Vec<String>,
    pub retired: Vec<String>,
}

/// Periodically probes remote nodes and feeds the results to the registry
pub struct HeartbeatMonitor {
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<Scheduler>,
}

impl HeartbeatMonitor {
    pub fn new(dispatcher: Arc<Dispatcher>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            dispatcher,
            scheduler,
        }
    }

    /// Probe every `heartbeat_interval` until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.dispatcher.registry().policy().heartbeat_interval;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_ms = interval.as_millis() as u64, "Heartbeat monitor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Heartbeat monitor stopped");
    }

    /// One probe round over all remote, non-retired nodes
    pub async fn sweep(&self) -> SweepReport {
        let registry = self.dispatcher.registry();
        let timeout = registry.policy().heartbeat_timeout;
        let targets = registry.probe_targets();

        let probes = targets.into_iter().map(|(node_id, _)| {
            let transport = self.dispatcher.transport(&node_id);
            async move {
                let result = match transport {
                    Some(transport) => match tokio::time::timeout(timeout, transport.health()).await {
                        Ok(result) => result,
                        Err(_) => Err(EngineError::transport(&node_id, "heartbeat timed out")),
                    },
                    None => Err(EngineError::transport(&node_id, "no transport registered")),
                };
                (node_id, result)
            }
        });
        let results = join_all(probes).await;

        let now = Utc::now();
        let mut report = SweepReport {
            probed: results.len(),
            ..Default::default()
        };
        for (node_id, result) in results {
            match result {
                Ok(health) if health.status != NodeHealth::Unreachable => {
                    report.answered += 1;
                    let transition = registry.heartbeat(&node_id, Some(health.capacity), now);
                    if transition.is_some() {
                        report.restored.push(node_id.clone());
                        self.scheduler.notify_capacity();
                    }
                    self.dispatcher.publish_transition(transition);
                }
                Ok(health) => {
                    debug!(node_id = %node_id, status = %health.status, "Node reports itself unavailable");
                    let transition = registry.record_missed_heartbeat(&node_id, now);
                    self.dispatcher.publish_transition(transition);
                }
                Err(e) => {
                    debug!(node_id = %node_id, error = %e, "Heartbeat missed");
                    let transition = registry.record_missed_heartbeat(&node_id, now);
                    self.dispatcher.publish_transition(transition);
                }
            }
        }

        report.retired = registry.retire_expired(now);
        if !report.retired.is_empty() {
            warn!(retired = ?report.retired, "Nodes retired");
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::events::{EngineEvent, EventBus};
    use crate::core::config::{DispatchConfig, HealthPolicy};
    use crate::core::errors::Result;
    use crate::core::model::TaskOutcome;
    use crate::dispatch::node::{Node, NodeConfig};
    use crate::dispatch::registry::NodeRegistry;
    use crate::dispatch::transport::NodeTransport;
    use crate::node::protocol::{ExecuteRequest, HealthResponse};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct Toggle(AtomicBool);

    #[async_trait]
    impl NodeTransport for Toggle {
        async fn execute(&self, _r: ExecuteRequest) -> Result<TaskOutcome> {
            Ok(TaskOutcome::Success(serde_json::Value::Null))
        }

        async fn health(&self) -> Result<HealthResponse> {
            if self.0.load(Ordering::SeqCst) {
                Ok(HealthResponse {
                    status: NodeHealth::Healthy,
                    load: 0,
                    capacity: 3,
                })
            } else {
                Err(EngineError::transport("n1", "connection refused"))
            }
        }

        async fn cancel(&self, _t: &str) -> Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_sweep_degrades_then_restores() {
        let registry = Arc::new(NodeRegistry::new(HealthPolicy {
            missed_heartbeat_threshold: 2,
            heartbeat_timeout: Duration::from_millis(50),
            unreachable_grace: Duration::from_secs(3600),
            ..Default::default()
        }));
        let events = Arc::new(EventBus::new());
        let mut subscription = events.subscribe();
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            DispatchConfig::default(),
            events.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(10, registry.clone()));
        registry.register(Node::from_config(&NodeConfig::new("n1", "127.0.0.1", 9)));
        registry.register(Node::local("local", 1));
        let toggle = Arc::new(Toggle(AtomicBool::new(false)));
        dispatcher.add_transport("n1", toggle.clone());

        let monitor = HeartbeatMonitor::new(dispatcher, scheduler);
        let report = monitor.sweep().await;
        assert_eq!(report.probed, 1);
        assert_eq!(report.answered, 0);
        assert_eq!(registry.get("n1").unwrap().health, NodeHealth::Degraded);

        monitor.sweep().await;
        assert_eq!(registry.get("n1").unwrap().health, NodeHealth::Unreachable);

        toggle.0.store(true, Ordering::SeqCst);
        let report = monitor.sweep().await;
        assert_eq!(report.restored, vec!["n1".to_string()]);
        let node = registry.get("n1").unwrap();
        assert_eq!(node.health, NodeHealth::Healthy);
        assert_eq!(node.capacity, 3);

        let mut seen = Vec::new();
        while let Ok(event) = subscription.receiver.try_recv() {
            if let EngineEvent::NodeHealthChanged { to, .. } = event {
                seen.push(to);
            }
        }
        assert_eq!(
            seen,
            vec![NodeHealth::Degraded, NodeHealth::Unreachable, NodeHealth::Healthy]
        );
    }
}
