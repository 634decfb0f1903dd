use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::core::config::TieBreak;
use crate::core::errors::{EngineError, Result};
use crate::core::model::TaskId;
use crate::scheduler::ready_queue::ReadyQueue;

/// Live view of cluster capacity used to throttle releases
pub trait CapacityProvider: Send + Sync {
    /// Sum of capacities over Healthy, non-retired nodes
    fn healthy_capacity(&self) -> usize;
    /// Sum of current load over all nodes
    fn global_load(&self) -> usize;
}

/// Snapshot of scheduler counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub queued: usize,
    pub in_flight: usize,
    pub emitted_total: u64,
    /// Pulls that found queued work but no free capacity
    pub throttled: u64,
}

struct SchedulerState {
    queue: ReadyQueue,
    in_flight: HashSet<TaskId>,
}

/// Releases Ready tasks by priority, never more than healthy capacity allows.
pub struct Scheduler {
    state: Mutex<SchedulerState>,
    capacity: Arc<dyn CapacityProvider>,
    /// Ready-promotion sequence, the tie-break among equal priorities
    seq: AtomicU64,
    tie_break: TieBreak,
    work: Notify,
    emitted_total: AtomicU64,
    throttled: AtomicU64,
}

impl Scheduler {
    pub fn new(queue_capacity: usize, capacity: Arc<dyn CapacityProvider>) -> Self {
        Self {
            state: Mutex::new(SchedulerState {
                queue: ReadyQueue::new(queue_capacity),
                in_flight: HashSet::new(),
            }),
            capacity,
            seq: AtomicU64::new(0),
            tie_break: TieBreak::Fifo,
            work: Notify::new(),
            emitted_total: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
        }
    }

    pub fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    /// Queue position among equal priorities; the queue pops the lowest first
    fn next_seq(&self) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        match self.tie_break {
            TieBreak::Fifo => seq,
            TieBreak::Lifo => u64::MAX - seq,
        }
    }

    /// Queue a newly Ready task
    pub fn enqueue(&self, task_id: &str, priority: i32) -> Result<()> {
        let seq = self.next_seq();
        {
            let mut state = self.state.lock();
            if !state.queue.push(task_id.to_string(), priority, seq) {
                let capacity = state.queue.capacity();
                warn!(task_id = %task_id, capacity, "Ready queue full");
                return Err(EngineError::QueueFull { capacity });
            }
        }
        debug!(task_id = %task_id, priority, "Task queued");
        self.work.notify_one();
        Ok(())
    }

    /// Put an in-flight task back in the queue after backpressure or failover.
    ///
    /// The task was admitted before, so the capacity bound does not apply.
    pub fn requeue(&self, task_id: &str, priority: i32) {
        let seq = self.next_seq();
        {
            let mut state = self.state.lock();
            state.in_flight.remove(task_id);
            state.queue.push_unbounded(task_id.to_string(), priority, seq);
        }
        debug!(task_id = %task_id, priority, "Task requeued");
    }

    /// Release up to `max` task ids without blocking.
    ///
    /// Bounded by `healthy capacity - max(global load, in-flight)`.
    pub fn pull(&self, max: usize) -> Vec<TaskId> {
        let healthy = self.capacity.healthy_capacity();
        let load = self.capacity.global_load();

        let mut state = self.state.lock();
        if state.queue.is_empty() {
            return Vec::new();
        }
        let busy = load.max(state.in_flight.len());
        let available = healthy.saturating_sub(busy).min(max);
        if available == 0 {
            self.throttled.fetch_add(1, Ordering::Relaxed);
            trace!(healthy, busy, queued = state.queue.len(), "Scheduler saturated");
            return Vec::new();
        }

        let mut released = Vec::with_capacity(available);
        while released.len() < available {
            match state.queue.pop() {
                Some(task_id) => {
                    state.in_flight.insert(task_id.clone());
                    released.push(task_id);
                }
                None => break,
            }
        }
        self.emitted_total
            .fetch_add(released.len() as u64, Ordering::Relaxed);
        debug!(count = released.len(), healthy, busy, "Released tasks for dispatch");
        released
    }

    /// Free the in-flight slot held by a finished task
    pub fn complete(&self, task_id: &str) {
        let removed = self.state.lock().in_flight.remove(task_id);
        if removed {
            self.work.notify_one();
        }
    }

    /// Drop a task from the queue or the in-flight set, returning whether it was known
    pub fn remove(&self, task_id: &str) -> bool {
        let mut state = self.state.lock();
        let queued = state.queue.remove(task_id);
        let in_flight = state.in_flight.remove(task_id);
        drop(state);
        if in_flight {
            self.work.notify_one();
        }
        queued || in_flight
    }

    /// Wake the dispatch loop because capacity may have changed
    pub fn notify_capacity(&self) {
        self.work.notify_one();
    }

    /// Resolves once new work or capacity has been signalled
    pub async fn wait_for_work(&self) {
        self.work.notified().await;
    }

    pub fn is_in_flight(&self, task_id: &str) -> bool {
        self.state.lock().in_flight.contains(task_id)
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.state.lock();
        SchedulerStats {
            queued: state.queue.len(),
            in_flight: state.in_flight.len(),
            emitted_total: self.emitted_total.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct FixedCapacity {
        healthy: AtomicUsize,
        load: AtomicUsize,
    }

    impl FixedCapacity {
        fn new(healthy: usize) -> Arc<Self> {
            Arc::new(Self {
                healthy: AtomicUsize::new(healthy),
                load: AtomicUsize::new(0),
            })
        }
    }

    impl CapacityProvider for FixedCapacity {
        fn healthy_capacity(&self) -> usize {
            self.healthy.load(Ordering::SeqCst)
        }

        fn global_load(&self) -> usize {
            self.load.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_pull_respects_priority() {
        let scheduler = Scheduler::new(100, FixedCapacity::new(10));
        scheduler.enqueue("bulk", 0).unwrap();
        scheduler.enqueue("urgent", 10).unwrap();
        scheduler.enqueue("bulk-2", 0).unwrap();

        assert_eq!(scheduler.pull(10), vec!["urgent", "bulk", "bulk-2"]);
        assert_eq!(scheduler.stats().in_flight, 3);
    }

    #[test]
    fn test_lifo_tie_break() {
        let scheduler =
            Scheduler::new(100, FixedCapacity::new(10)).with_tie_break(TieBreak::Lifo);
        scheduler.enqueue("first", 1).unwrap();
        scheduler.enqueue("second", 1).unwrap();
        scheduler.enqueue("top", 2).unwrap();

        assert_eq!(scheduler.pull(10), vec!["top", "second", "first"]);
    }

    #[test]
    fn test_pull_bounded_by_capacity() {
        let capacity = FixedCapacity::new(2);
        let scheduler = Scheduler::new(100, capacity.clone());
        for id in ["a", "b", "c", "d"] {
            scheduler.enqueue(id, 0).unwrap();
        }

        assert_eq!(scheduler.pull(10).len(), 2);
        assert!(scheduler.pull(10).is_empty());
        assert_eq!(scheduler.stats().throttled, 1);

        scheduler.complete("a");
        assert_eq!(scheduler.pull(10), vec!["c"]);

        // External load counts even when nothing is in flight here
        capacity.load.store(5, Ordering::SeqCst);
        scheduler.complete("b");
        scheduler.complete("c");
        assert!(scheduler.pull(10).is_empty());
        assert_eq!(scheduler.stats().queued, 1);
    }

    #[test]
    fn test_queue_full() {
        let scheduler = Scheduler::new(1, FixedCapacity::new(1));
        scheduler.enqueue("a", 0).unwrap();
        let err = scheduler.enqueue("b", 0).unwrap_err();
        assert!(matches!(err, EngineError::QueueFull { capacity: 1 }));
    }

    #[test]
    fn test_requeue_and_remove() {
        let scheduler = Scheduler::new(1, FixedCapacity::new(1));
        scheduler.enqueue("a", 0).unwrap();
        assert_eq!(scheduler.pull(1), vec!["a"]);
        scheduler.enqueue("b", 0).unwrap();

        scheduler.requeue("a", 0);
        assert!(!scheduler.is_in_flight("a"));
        assert_eq!(scheduler.stats().queued, 2);

        assert!(scheduler.remove("b"));
        assert!(!scheduler.remove("b"));
        assert_eq!(scheduler.pull(5), vec!["a"]);
    }

    #[tokio::test]
    async fn test_enqueue_wakes_waiter() {
        let scheduler = Arc::new(Scheduler::new(10, FixedCapacity::new(1)));
        let waiter = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.wait_for_work().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler.enqueue("a", 0).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }
}
