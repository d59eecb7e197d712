//! Holding area for results that could not be delivered.
//!
//! When a worker finishes a request while no shepherd session is live, the
//! (result, request) pair lands here instead of being dropped. The control
//! channel drains the sink in enqueue order on the next successful handshake,
//! before it accepts any new assignment. Entries are never lost while the
//! process is alive: they are delivered or they stay queued.
//!
//! Access discipline: workers are the only writers; the control channel is
//! the only reader, and only during the post-reconnect drain.

use std::collections::VecDeque;

use tokio::sync::Mutex;
use tracing::debug;

use crate::job::OrphanedResult;

/// In-process queue of undeliverable results, in completion order.
pub struct OrphanSink {
    inner: Mutex<VecDeque<OrphanedResult>>,
}

impl OrphanSink {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    /// Append a pair. Infallible: the sink never refuses or drops an entry.
    pub async fn push(&self, orphan: OrphanedResult) {
        debug!(request_id = orphan.result.request_id, "result orphaned");
        self.inner.lock().await.push_back(orphan);
    }

    /// Remove and return every queued pair, oldest first.
    pub async fn drain(&self) -> Vec<OrphanedResult> {
        self.inner.lock().await.drain(..).collect()
    }

    /// Put back entries that failed to redeliver, ahead of anything queued
    /// since the drain started. `entries` must still be in their original
    /// order; pairs pushed by workers mid-drain completed later, so placing
    /// the returned batch in front preserves global completion order.
    pub async fn requeue_front(&self, entries: Vec<OrphanedResult>) {
        let mut buf = self.inner.lock().await;
        for orphan in entries.into_iter().rev() {
            buf.push_front(orphan);
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for OrphanSink {
    fn default() -> Self {
        Self::new()
    }
}
