//! Bounded FIFO hand-off between the control channel and the worker pool.
//!
//! `put` waits while the queue is full, `get` waits while it is empty, and
//! both unwind with [`QueueError::Cancelled`] once the shutdown flag is set.
//! There is no priority ordering: requests are executed strictly in arrival
//! order. That trades deadline-aware scheduling for simplicity, and is a
//! deliberate choice rather than an oversight.

use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify};

use crate::job::TestRequest;
use crate::shutdown::Shutdown;

/// Errors from queue operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("dispatch queue operation cancelled by shutdown")]
    Cancelled,
}

/// Bounded FIFO of pending test requests.
///
/// One producer (the control channel) and any number of consumers (the
/// worker pool). Waiters always re-check the buffer after waking, so a
/// notification consumed by a faster peer is never a correctness problem.
pub struct DispatchQueue {
    inner: Mutex<VecDeque<TestRequest>>,
    capacity: usize,
    not_full: Notify,
    not_empty: Notify,
    shutdown: Shutdown,
}

impl DispatchQueue {
    pub fn new(capacity: usize, shutdown: Shutdown) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            not_full: Notify::new(),
            not_empty: Notify::new(),
            shutdown,
        }
    }

    /// Append a request, waiting while the queue is at capacity.
    pub async fn put(&self, request: TestRequest) -> Result<(), QueueError> {
        loop {
            if self.shutdown.is_triggered() {
                return Err(QueueError::Cancelled);
            }
            {
                let mut buf = self.inner.lock().await;
                if buf.len() < self.capacity {
                    buf.push_back(request);
                    let more_room = buf.len() < self.capacity;
                    drop(buf);
                    self.not_empty.notify_one();
                    // notify_one stores at most one permit, so back-to-back
                    // notifies against not-yet-parked waiters coalesce; a
                    // successful operation passes the wakeup on while its
                    // condition still holds.
                    if more_room {
                        self.not_full.notify_one();
                    }
                    return Ok(());
                }
            }
            tokio::select! {
                _ = self.not_full.notified() => {}
                _ = self.shutdown.triggered() => return Err(QueueError::Cancelled),
            }
        }
    }

    /// Remove the oldest request, waiting while the queue is empty.
    pub async fn get(&self) -> Result<TestRequest, QueueError> {
        loop {
            if self.shutdown.is_triggered() {
                return Err(QueueError::Cancelled);
            }
            {
                let mut buf = self.inner.lock().await;
                if let Some(request) = buf.pop_front() {
                    let more_items = !buf.is_empty();
                    drop(buf);
                    self.not_full.notify_one();
                    if more_items {
                        self.not_empty.notify_one();
                    }
                    return Ok(request);
                }
            }
            tokio::select! {
                _ = self.not_empty.notified() => {}
                _ = self.shutdown.triggered() => return Err(QueueError::Cancelled),
            }
        }
    }

    /// Number of requests currently buffered.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
