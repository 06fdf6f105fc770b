//! Close-once cancellation signal.
//!
//! Every cluster session owns one; the runtime owns one more for
//! process-wide shutdown. Clones share the same state.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Close the signal. Closing twice is a no-op.
    pub fn close(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal is closed (immediately if it already is).
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn close_wakes_every_clone() {
        let signal = ShutdownSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.closed().await })
        };
        assert!(!signal.is_closed());
        signal.close();
        signal.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .expect("join");
        assert!(signal.is_closed());
    }

    #[tokio::test]
    async fn closed_resolves_after_the_fact() {
        let signal = ShutdownSignal::new();
        signal.close();
        tokio::time::timeout(Duration::from_millis(50), signal.closed())
            .await
            .expect("already closed");
    }
}
