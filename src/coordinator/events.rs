//! Engine lifecycle events.
//!
//! Subscribers get an unbounded channel each so a slow consumer never stalls
//! the dispatch loop. Receivers that were dropped are pruned on the next publish.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::trace;

use crate::core::model::{NodeId, TaskId};
use crate::dispatch::node::NodeHealth;
use crate::storage::PoolState;

/// Events emitted for task, node and pool state changes
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    TaskSubmitted {
        task_id: TaskId,
    },
    /// All dependencies succeeded; the task is queued
    TaskReady {
        task_id: TaskId,
    },
    TaskStarted {
        task_id: TaskId,
        node_id: NodeId,
        attempt: u32,
    },
    /// Put back in the ready queue after backpressure or failover
    TaskRequeued {
        task_id: TaskId,
        reason: String,
    },
    TaskSucceeded {
        task_id: TaskId,
        node_id: NodeId,
    },
    TaskFailed {
        task_id: TaskId,
        error: String,
    },
    TaskCancelled {
        task_id: TaskId,
    },
    NodeHealthChanged {
        node_id: NodeId,
        from: NodeHealth,
        to: NodeHealth,
    },
    PoolStateChanged {
        from: PoolState,
        to: PoolState,
    },
}

pub type SubscriptionId = u64;

/// A live subscription; drop the receiver or call `unsubscribe` to end it
pub struct Subscription {
    pub id: SubscriptionId,
    pub receiver: mpsc::UnboundedReceiver<EngineEvent>,
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<(SubscriptionId, mpsc::UnboundedSender<EngineEvent>)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, receiver) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push((id, tx));
        Subscription { id, receiver }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(sub_id, _)| *sub_id != id);
        subscribers.len() != before
    }

    pub fn publish(&self, event: EngineEvent) {
        trace!(event = ?event, "Publishing event");
        self.subscribers
            .lock()
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
