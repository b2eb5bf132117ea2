//! Document-level cancellation.
//!
//! A [`CancelToken`] is cloned into every page task. Cancelling it stops
//! pages that have not started and drops in-flight ones; dropping an OCR
//! future kills its child process.

use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable cancellation handle.
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

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender gone without cancelling: never resolves.
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        assert!(!token.is_cancelled());
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter woke")
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[test]
    fn already_cancelled_resolves_immediately() {
        let token = CancelToken::new();
        token.cancel();
        let mut fut = task::spawn(token.cancelled());
        assert_ready!(fut.poll());
    }

    #[test]
    fn pending_until_cancelled() {
        let token = CancelToken::new();
        let mut fut = task::spawn(token.cancelled());
        assert_pending!(fut.poll());
        token.clone().cancel();
        assert!(fut.is_woken());
        assert_ready!(fut.poll());
    }
}
