use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::coordinator::events::{EngineEvent, EventBus};
use crate::core::config::DispatchConfig;
use crate::core::errors::EngineError;
use crate::core::model::{NodeId, TaskId, TaskOutcome};
use crate::dispatch::registry::{HealthTransition, NodeRegistry};
use crate::dispatch::transport::NodeTransport;
use crate::node::protocol::ExecuteRequest;

/// Result of one dispatch call
#[derive(Debug)]
pub enum DispatchOutcome {
    /// A node ran the task; the outcome may still be a task failure
    Completed {
        node_id: NodeId,
        outcome: TaskOutcome,
        attempts: u32,
    },
    /// No node could take the task right now; put it back in the queue
    Requeue { reason: EngineError, attempts: u32 },
    /// Attempts ran out across nodes
    Exhausted(EngineError),
    /// The task was interrupted while running
    Cancelled { attempts: u32 },
}

/// Sends tasks to nodes with health-aware failover
pub struct Dispatcher {
    registry: Arc<NodeRegistry>,
    transports: RwLock<HashMap<NodeId, Arc<dyn NodeTransport>>>,
    config: DispatchConfig,
    events: Arc<EventBus>,
    /// Task -> node currently running it
    active: DashMap<TaskId, NodeId>,
}

impl Dispatcher {
    pub fn new(registry: Arc<NodeRegistry>, config: DispatchConfig, events: Arc<EventBus>) -> Self {
        Self {
            registry,
            transports: RwLock::new(HashMap::new()),
            config,
            events,
            active: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn add_transport(&self, node_id: impl Into<NodeId>, transport: Arc<dyn NodeTransport>) {
        self.transports.write().insert(node_id.into(), transport);
    }

    pub fn remove_transport(&self, node_id: &str) -> Option<Arc<dyn NodeTransport>> {
        self.transports.write().remove(node_id)
    }

    pub fn transport(&self, node_id: &str) -> Option<Arc<dyn NodeTransport>> {
        self.transports.read().get(node_id).cloned()
    }

    pub fn default_timeout(&self) -> Duration {
        self.config.default_task_timeout
    }

    /// Node currently running `task_id`, if any
    pub fn assigned_node(&self, task_id: &str) -> Option<NodeId> {
        self.active.get(task_id).map(|entry| entry.value().clone())
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub(crate) fn publish_transition(&self, transition: Option<HealthTransition>) {
        if let Some(t) = transition {
            self.events.publish(EngineEvent::NodeHealthChanged {
                node_id: t.node_id,
                from: t.from,
                to: t.to,
            });
        }
    }

    /// Run `request` on the best available node, failing over on transport errors.
    ///
    /// `prior_attempts` carries the attempt count from earlier requeues so the
    /// bound holds across the task's lifetime.
    pub async fn dispatch(
        &self,
        request: ExecuteRequest,
        prior_attempts: u32,
        timeout: Duration,
    ) -> DispatchOutcome {
        let task_id = request.task_id.clone();
        let mut attempts = prior_attempts;
        let mut tried: HashSet<NodeId> = HashSet::new();
        let mut last_error: Option<EngineError> = None;

        loop {
            if attempts >= self.config.max_attempts {
                let last = last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "attempt budget already spent".to_string());
                error!(task_id = %task_id, attempts, last_error = %last, "Dispatch exhausted");
                return DispatchOutcome::Exhausted(EngineError::DispatchExhausted {
                    task_id,
                    attempts,
                    last_error: last,
                });
            }

            let Some(node_id) = self.registry.select_and_reserve(&tried) else {
                let reason = last_error.unwrap_or_else(|| EngineError::NodeUnavailable {
                    task_id: task_id.clone(),
                });
                debug!(task_id = %task_id, attempts, reason = %reason, "No node available, requeueing");
                return DispatchOutcome::Requeue { reason, attempts };
            };

            let Some(transport) = self.transport(&node_id) else {
                warn!(node_id = %node_id, "Registered node has no transport");
                self.registry.release(&node_id);
                tried.insert(node_id.clone());
                last_error = Some(EngineError::transport(node_id, "no transport registered"));
                continue;
            };

            attempts += 1;
            self.active.insert(task_id.clone(), node_id.clone());
            self.events.publish(EngineEvent::TaskStarted {
                task_id: task_id.clone(),
                node_id: node_id.clone(),
                attempt: attempts,
            });
            info!(task_id = %task_id, node_id = %node_id, attempt = attempts, "Dispatching task");

            let result = match tokio::time::timeout(timeout, transport.execute(request.clone())).await {
                Ok(result) => result,
                Err(_) => {
                    // The node may still be working on it
                    let id = task_id.clone();
                    let remote = transport.clone();
                    tokio::spawn(async move {
                        let _ = remote.cancel(&id).await;
                    });
                    Err(EngineError::Timeout {
                        task_id: task_id.clone(),
                        node_id: node_id.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    })
                }
            };

            // Whoever removes the active entry owns the slot release
            if self.active.remove(&task_id).is_none() {
                debug!(task_id = %task_id, node_id = %node_id, "Task was interrupted");
                return DispatchOutcome::Cancelled { attempts };
            }

            match result {
                Ok(outcome) => {
                    let transition = if outcome.is_success() {
                        self.registry.record_success(&node_id)
                    } else {
                        self.registry.record_task_failure(&node_id)
                    };
                    self.publish_transition(transition);
                    return DispatchOutcome::Completed {
                        node_id,
                        outcome,
                        attempts,
                    };
                }
                Err(EngineError::Cancelled { .. }) => {
                    self.registry.release(&node_id);
                    return DispatchOutcome::Cancelled { attempts };
                }
                Err(e) => {
                    warn!(
                        task_id = %task_id,
                        node_id = %node_id,
                        attempt = attempts,
                        error = %e,
                        "Dispatch attempt failed, failing over"
                    );
                    let transition = self.registry.record_failure(&node_id, Utc::now());
                    self.publish_transition(transition);
                    tried.insert(node_id);
                    last_error = Some(e);
                }
            }
        }
    }

    /// Best-effort stop of a running task and release of its slot
    pub fn interrupt(&self, task_id: &str) -> bool {
        let Some((_, node_id)) = self.active.remove(task_id) else {
            return false;
        };
        self.registry.release(&node_id);
        if let Some(transport) = self.transport(&node_id) {
            let id = task_id.to_string();
            let node = node_id.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.cancel(&id).await {
                    debug!(task_id = %id, node_id = %node, error = %e, "Interrupt not delivered");
                }
            });
        }
        info!(task_id = %task_id, node_id = %node_id, "Interrupted running task");
        true
    }
}
