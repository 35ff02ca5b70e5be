//! In-memory bounded priority queue.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::domain::MessageTask;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Returned by `push` when the queue is at capacity. Hands the task back.
#[derive(Debug)]
pub struct QueueFull(pub MessageTask);

/// Bounded priority queue of outbound tasks.
///
/// `BinaryHeap` is a max-heap, so tasks are wrapped in `Reverse` and the
/// smallest `(priority, timestamp, sequence)` comes out first.
pub struct PriorityMessageQueue {
    heap: Mutex<BinaryHeap<Reverse<MessageTask>>>,
    notify: Notify,
    capacity: usize,
    next_sequence: AtomicU64,
}

impl PriorityMessageQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            capacity,
            next_sequence: AtomicU64::new(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Admit a fresh task. Assigns its admission sequence.
    pub fn push(&self, mut task: MessageTask) -> Result<(), QueueFull> {
        {
            let mut heap = self.heap.lock();
            if heap.len() >= self.capacity {
                return Err(QueueFull(task));
            }
            task.sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
            heap.push(Reverse(task));
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Requeue a task that already held a slot.
    ///
    /// Skips the capacity check and keeps the original sequence so the task
    /// keeps its place among equal-priority peers.
    pub fn push_retry(&self, task: MessageTask) {
        self.heap.lock().push(Reverse(task));
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<MessageTask> {
        self.heap.lock().pop().map(|Reverse(task)| task)
    }

    /// Wait up to `timeout` for the most urgent task.
    pub async fn pop(&self, timeout: Duration) -> Option<MessageTask> {
        let deadline = Instant::now() + timeout;
        loop {
            // notified() を先に作ってから確認する（取りこぼし防止）
            let notified = self.notify.notified();
            if let Some(task) = self.try_pop() {
                return Some(task);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    /// Drop every queued task without invoking callbacks.
    pub fn clear(&self) -> usize {
        let mut heap = self.heap.lock();
        let dropped = heap.len();
        heap.clear();
        dropped
    }
}

impl Default for PriorityMessageQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
