use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::core::model::TaskId;

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueuedTask {
    priority: i32,
    seq: u64,
    task_id: TaskId,
}

impl Ord for QueuedTask {
    // Max-heap: higher priority first, then earlier promotion
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Bounded priority queue of Ready task ids with capacity control
#[derive(Debug)]
pub struct ReadyQueue {
    heap: BinaryHeap<QueuedTask>,
    capacity: usize,
}

impl ReadyQueue {
    /// Creates a new ReadyQueue with the specified capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            capacity,
        }
    }

    /// Attempts to push an item onto the queue.
    /// Returns false if the queue is at capacity (backpressure)
    pub fn push(&mut self, task_id: TaskId, priority: i32, seq: u64) -> bool {
        if self.is_full() {
            return false;
        }
        self.push_unbounded(task_id, priority, seq);
        true
    }

    /// Push ignoring the capacity bound, for tasks that were admitted earlier
    pub fn push_unbounded(&mut self, task_id: TaskId, priority: i32, seq: u64) {
        self.heap.push(QueuedTask {
            priority,
            seq,
            task_id,
        });
    }

    pub fn pop(&mut self) -> Option<TaskId> {
        self.heap.pop().map(|queued| queued.task_id)
    }

    /// Remove a queued task, returning whether it was present
    pub fn remove(&mut self, task_id: &str) -> bool {
        let before = self.heap.len();
        self.heap.retain(|queued| queued.task_id != task_id);
        self.heap.len() != before
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.heap.iter().any(|queued| queued.task_id == task_id)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_operations() {
        let mut queue = ReadyQueue::new(3);
        assert!(queue.is_empty());
        assert_eq!(queue.pop(), None);

        assert!(queue.push("a".into(), 0, 1));
        assert!(queue.push("b".into(), 0, 2));
        assert!(queue.push("c".into(), 0, 3));
        assert!(queue.is_full());

        // Capacity limit
        assert!(!queue.push("d".into(), 9, 4));
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.pop().as_deref(), Some("a"));
        assert!(queue.push("d".into(), 0, 4));
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_priority_then_fifo() {
        let mut queue = ReadyQueue::new(10);
        queue.push("low".into(), 1, 1);
        queue.push("high-late".into(), 5, 4);
        queue.push("high-early".into(), 5, 2);
        queue.push("mid".into(), 3, 3);

        let order: Vec<_> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(order, vec!["high-early", "high-late", "mid", "low"]);
    }

    #[test]
    fn test_remove_and_unbounded_push() {
        let mut queue = ReadyQueue::new(1);
        queue.push("a".into(), 0, 1);
        queue.push_unbounded("b".into(), 0, 2);
        assert_eq!(queue.len(), 2);

        assert!(queue.remove("a"));
        assert!(!queue.remove("a"));
        assert!(queue.contains("b"));
        assert_eq!(queue.pop().as_deref(), Some("b"));
    }
}
