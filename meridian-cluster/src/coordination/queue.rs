use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::VecDeque;
use std::time::Duration;

use super::deadline;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
    /// Items without a TTL never expire
    pub ttl: Option<Duration>,
    pub dequeue_attempts: u32,
}

impl QueueItem {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.ttl.is_some_and(|ttl| now > deadline(self.enqueued_at, ttl))
    }
}

/// Bounded work queue.
///
/// A FIFO queue keeps enqueue order. Otherwise items are kept sorted by
/// descending priority, equal priorities in enqueue order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributedQueue {
    pub id: String,
    pub items: VecDeque<QueueItem>,
    pub fifo: bool,
    pub max_size: Option<usize>,
}

impl DistributedQueue {
    #[must_use]
    pub fn new(id: impl Into<String>, fifo: bool, max_size: Option<usize>) -> Self {
        Self {
            id: id.into(),
            items: VecDeque::new(),
            fifo,
            max_size,
        }
    }

    /// Drop expired items, keeping the relative order of the rest
    pub fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.items.len();
        self.items.retain(|item| !item.is_expired(now));
        before - self.items.len()
    }

    /// Append an item; returns its id, or `None` when the queue is full
    pub fn enqueue(
        &mut self,
        payload: serde_json::Value,
        priority: i32,
        ttl: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Option<String> {
        self.sweep(now);
        if self.max_size.is_some_and(|max| self.items.len() >= max) {
            return None;
        }

        let id = format!("item_{}", nanoid::nanoid!(12));
        self.items.push_back(QueueItem {
            id: id.clone(),
            payload,
            priority,
            enqueued_at: now,
            ttl,
            dequeue_attempts: 0,
        });
        if !self.fifo {
            // Stable sort keeps enqueue order among equal priorities
            self.items
                .make_contiguous()
                .sort_by_key(|item| Reverse(item.priority));
        }
        Some(id)
    }

    pub fn dequeue(&mut self, now: DateTime<Utc>) -> Option<QueueItem> {
        self.sweep(now);
        let mut item = self.items.pop_front()?;
        item.dequeue_attempts += 1;
        Some(item)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
