//! Bounded Delivery Queue
//!
//! Single-producer (dispatcher) / single-consumer (drain loop) FIFO with a
//! fixed capacity. The lock is held only for `VecDeque` operations; waiting
//! happens on a pair of `Notify` handles, one per direction.
//!
//! The closed flag lives under the same lock as the items, so once
//! [`DeliveryQueue::close`] returns no producer can enqueue again.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::domain::streaming::MarketUpdate;

/// A push that could not be completed. The update is handed back.
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    /// The queue is at capacity.
    #[error("queue full")]
    Full(MarketUpdate),
    /// The queue has been closed.
    #[error("queue closed")]
    Closed(MarketUpdate),
}

#[derive(Debug)]
struct QueueState {
    items: VecDeque<MarketUpdate>,
    closed: bool,
}

/// Bounded FIFO of market updates.
#[derive(Debug)]
pub struct DeliveryQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    readable: Notify,
    writable: Notify,
}

impl DeliveryQueue {
    /// Create a queue. A capacity of zero is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity,
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    /// Enqueue if there is room.
    ///
    /// # Errors
    ///
    /// Returns the update inside [`PushError`] if the queue is full or closed.
    pub fn try_push(&self, update: MarketUpdate) -> Result<(), PushError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PushError::Closed(update));
            }
            if state.items.len() >= self.capacity {
                return Err(PushError::Full(update));
            }
            state.items.push_back(update);
        }
        self.readable.notify_one();
        Ok(())
    }

    /// Enqueue, evicting the oldest element if the queue is full.
    ///
    /// Returns the evicted element, if any.
    ///
    /// # Errors
    ///
    /// Returns [`PushError::Closed`] if the queue is closed.
    pub fn push_evicting(&self, update: MarketUpdate) -> Result<Option<MarketUpdate>, PushError> {
        let evicted = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PushError::Closed(update));
            }
            let evicted = if state.items.len() >= self.capacity {
                state.items.pop_front()
            } else {
                None
            };
            state.items.push_back(update);
            evicted
        };
        self.readable.notify_one();
        Ok(evicted)
    }

    /// Enqueue, waiting up to `timeout` for room.
    ///
    /// # Errors
    ///
    /// Returns [`PushError::Full`] if no room appeared before the timeout,
    /// or [`PushError::Closed`] if the queue was closed meanwhile.
    pub async fn push_timeout(
        &self,
        update: MarketUpdate,
        timeout: Duration,
    ) -> Result<(), PushError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut update = update;

        loop {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_push(update) {
                Ok(()) => return Ok(()),
                Err(PushError::Full(returned)) => update = returned,
                Err(closed @ PushError::Closed(_)) => return Err(closed),
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(PushError::Full(update));
            }
        }
    }

    /// Dequeue without waiting.
    pub fn try_pop(&self) -> Option<MarketUpdate> {
        let item = self.state.lock().items.pop_front();
        if item.is_some() {
            self.writable.notify_one();
        }
        item
    }

    /// Dequeue, waiting for an element.
    ///
    /// Returns `None` once the queue is closed and empty.
    pub async fn pop(&self) -> Option<MarketUpdate> {
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(item) = state.items.pop_front() {
                    drop(state);
                    self.writable.notify_one();
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Refuse further pushes and wake all waiters. Queued items remain
    /// available to [`pop`](Self::pop).
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    /// Discard all queued items, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let dropped = {
            let mut state = self.state.lock();
            let dropped = state.items.len();
            state.items.clear();
            dropped
        };
        self.writable.notify_waiters();
        dropped
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Fixed capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy of the queued items, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<MarketUpdate> {
        self.state.lock().items.iter().cloned().collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
