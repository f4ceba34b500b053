//! Buffer for local deltas produced before the session is joined.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// A local delta waiting for the session to be joined
#[derive(Debug, Clone)]
pub struct PendingUpdate {
    pub payload: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,
}

/// FIFO of pending local deltas.
///
/// Deltas leave the queue in the order they entered it, exactly once.
#[derive(Debug, Default)]
pub struct PendingUpdateQueue {
    queue: VecDeque<PendingUpdate>,
}

impl PendingUpdateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delta to the back of the queue
    pub fn enqueue(&mut self, payload: Vec<u8>) {
        self.queue.push_back(PendingUpdate {
            payload,
            enqueued_at: Utc::now(),
        });
    }

    /// Take every queued delta, oldest first, leaving the queue empty
    pub fn drain(&mut self) -> Vec<PendingUpdate> {
        self.queue.drain(..).collect()
    }

    /// Put undelivered deltas back in front of anything queued since
    pub fn requeue_front(&mut self, updates: Vec<PendingUpdate>) {
        for update in updates.into_iter().rev() {
            self.queue.push_front(update);
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Total bytes queued
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|u| u.payload.len()).sum()
    }

    /// Age of the oldest queued delta
    pub fn oldest(&self) -> Option<DateTime<Utc>> {
        self.queue.front().map(|u| u.enqueued_at)
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}
