//! Cooperative cancellation shared between the supervisor and session workers
//!
//! Workers check the flag once per loop iteration and sleep through
//! [`CancelToken::sleep`], which returns early when the token fires, so the
//! cancellation latency is bounded by one idle interval.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Clonable cancellation flag
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Fire the token; every clone observes it
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the token has fired
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Sleep for `period`, returning `false` if the token fired first
    pub async fn sleep(&self, period: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = self.cancelled() => false,
            _ = tokio::time::sleep(period) => !self.is_cancelled(),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
