//! Thread-safe FIFO carrying finished renders from producer to consumer.
//!
//! Pushing never blocks. Polling blocks for at most the given timeout so
//! consumer loops can notice a stop request between items.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

/// Backpressure policy when a consumer falls behind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueuePolicy {
    /// Grow without limit.
    #[default]
    Unbounded,
    /// Keep at most `capacity` items, evicting the oldest pending one.
    DropOldest { capacity: usize },
}

/// Multi-producer, multi-consumer handoff queue.
pub struct HandoffQueue<T> {
    items: Mutex<VecDeque<T>>,
    ready: Condvar,
    policy: QueuePolicy,
    /// Items evicted by the drop-oldest policy (atomic for lock-free reads).
    dropped: AtomicUsize,
}

impl<T> HandoffQueue<T> {
    pub fn new(policy: QueuePolicy) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            policy,
            dropped: AtomicUsize::new(0),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(QueuePolicy::Unbounded)
    }

    pub fn policy(&self) -> QueuePolicy {
        self.policy
    }

    /// Append an item. Returns the evicted item if the queue was full.
    pub fn push(&self, item: T) -> Option<T> {
        let evicted = {
            let mut items = self.items.lock();
            let evicted = match self.policy {
                QueuePolicy::DropOldest { capacity } if items.len() >= capacity.max(1) => {
                    items.pop_front()
                }
                _ => None,
            };
            items.push_back(item);
            evicted
        };
        if evicted.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.ready.notify_one();
        evicted
    }

    /// Wait up to `timeout` for the next item.
    pub fn poll(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            if self.ready.wait_until(&mut items, deadline).timed_out() {
                return items.pop_front();
            }
        }
    }

    /// Take the next item without waiting.
    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Discard everything pending without blocking. Returns how many were dropped.
    pub fn drain(&self) -> usize {
        let mut items = self.items.lock();
        let n = items.len();
        items.clear();
        n
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total items evicted by the drop-oldest policy.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<T> Default for HandoffQueue<T> {
    fn default() -> Self {
        Self::unbounded()
    }
}
