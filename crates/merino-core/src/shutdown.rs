//! Process-wide cooperative cancellation.
//!
//! A single flag, set once and never cleared. Every blocking wait in the
//! crate selects against [`Shutdown::triggered`] and unwinds through a
//! well-defined cancellation path instead of blocking forever. Cancellation
//! is cooperative, never preemptive, so that sandbox teardown always runs to
//! completion before a task exits.

use tokio::sync::watch;

/// Error returned by cancellable operations when the shutdown flag is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation cancelled by shutdown")]
pub struct Cancelled;

/// Cloneable handle to the process-wide shutdown flag.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            tx: std::sync::Arc::new(tx),
        }
    }

    /// Set the flag. Idempotent; the flag is never cleared.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Synchronous poll of the flag.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the flag is set. Usable in `tokio::select!` from any
    /// number of tasks concurrently.
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        // Closed sender implies the owning runtime is gone; treat as set.
        let _ = rx.wait_for(|v| *v).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
