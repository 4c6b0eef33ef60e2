//! A bounded, priority-ordered holding area for QUEUED jobs.
//!
//! Replaces the teacher's plain `mpsc` channel (pure FIFO, no concept of
//! priority) with a binary heap per the design notes: ordered on
//! `(priority, Reverse(sequence))` so higher priority dequeues first and,
//! within a priority, earlier-submitted jobs dequeue first. The "N workers
//! share one receiver" shape of the teacher's `worker.rs` is preserved —
//! workers call `pop` on a queue wrapped in `Arc`, rather than each owning
//! their own channel end.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use crate::error::CoreError;
use crate::models::Priority;

#[derive(Debug, Clone)]
pub struct QueueItem {
    pub request_id: String,
    pub priority: Priority,
    sequence: u64,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}
impl Eq for QueueItem {}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: higher priority must compare greater,
        // and among equal priorities, the earlier sequence number (FIFO)
        // must compare greater so it pops first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct PriorityQueue {
    heap: Mutex<BinaryHeap<QueueItem>>,
    notify: Notify,
    sequence: AtomicU64,
    capacity: usize,
}

impl PriorityQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            sequence: AtomicU64::new(0),
            capacity,
        })
    }

    /// Appends a job. Fails fast with `QueueFull` at capacity, per §4.2.
    pub async fn push(&self, request_id: String, priority: Priority) -> Result<(), CoreError> {
        let mut heap = self.heap.lock().await;
        if heap.len() >= self.capacity {
            return Err(CoreError::QueueFull);
        }
        let sequence = self.sequence.fetch_add(1, AtomicOrdering::Relaxed);
        heap.push(QueueItem {
            request_id,
            priority,
            sequence,
        });
        drop(heap);
        self.notify.notify_one();
        Ok(())
    }

    /// Blocks until an item is available, then pops the highest-priority,
    /// earliest-submitted one.
    pub async fn pop(&self) -> QueueItem {
        loop {
            {
                let mut heap = self.heap.lock().await;
                if let Some(item) = heap.pop() {
                    return item;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking pop used by shutdown draining and tests.
    pub async fn try_pop(&self) -> Option<QueueItem> {
        self.heap.lock().await.pop()
    }

    pub async fn len(&self) -> usize {
        self.heap.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Best-effort snapshot of the top N items, for `/queue/status`. Not a
    /// contract — advisory only, per §4.2.
    pub async fn snapshot(&self, top_n: usize) -> Vec<QueueItem> {
        let heap = self.heap.lock().await;
        let mut items: Vec<QueueItem> = heap.iter().cloned().collect();
        items.sort_by(|a, b| b.cmp(a));
        items.truncate(top_n);
        items
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn higher_priority_dequeues_first() {
        let q = PriorityQueue::new(10);
        q.push("a".into(), Priority(1)).await.unwrap();
        q.push("b".into(), Priority(5)).await.unwrap();
        let first = q.pop().await;
        assert_eq!(first.request_id, "b");
        let second = q.pop().await;
        assert_eq!(second.request_id, "a");
    }

    #[tokio::test]
    async fn equal_priority_is_fifo() {
        let q = PriorityQueue::new(10);
        q.push("first".into(), Priority(3)).await.unwrap();
        q.push("second".into(), Priority(3)).await.unwrap();
        assert_eq!(q.pop().await.request_id, "first");
        assert_eq!(q.pop().await.request_id, "second");
    }

    #[tokio::test]
    async fn rejects_past_capacity() {
        let q = PriorityQueue::new(2);
        q.push("a".into(), Priority(1)).await.unwrap();
        q.push("b".into(), Priority(1)).await.unwrap();
        let err = q.push("c".into(), Priority(1)).await;
        assert!(matches!(err, Err(CoreError::QueueFull)));
    }

    #[tokio::test]
    async fn accepts_again_after_pop() {
        let q = PriorityQueue::new(1);
        q.push("a".into(), Priority(1)).await.unwrap();
        assert!(q.push("b".into(), Priority(1)).await.is_err());
        q.pop().await;
        assert!(q.push("b".into(), Priority(1)).await.is_ok());
    }
}
