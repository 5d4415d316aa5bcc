//! Hand-off point for logins completed outside the process.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

/// One parked login per provider.
///
/// The provider parks while it holds its context lock; whoever finishes the
/// login (a dashboard, an operator, a test) calls [`complete`](Self::complete).
#[derive(Debug, Default)]
pub struct LoginGate {
    pending: Mutex<Option<oneshot::Sender<bool>>>,
}

impl LoginGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits up to `bound` for a completion. `true` only for a reported success.
    pub async fn wait(&self, bound: Duration) -> bool {
        let (tx, rx) = oneshot::channel();
        // A newer wait supersedes an abandoned one.
        *self.pending.lock() = Some(tx);

        let outcome = tokio::time::timeout(bound, rx).await;
        self.pending.lock().take();
        match outcome {
            Ok(Ok(success)) => success,
            Ok(Err(_)) => false,
            Err(_) => {
                debug!(bound_secs = bound.as_secs(), "login wait elapsed");
                false
            }
        }
    }

    /// Resolves a parked wait. Returns `false` when nothing was waiting.
    pub fn complete(&self, success: bool) -> bool {
        match self.pending.lock().take() {
            Some(tx) => tx.send(success).is_ok(),
            None => false,
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.pending.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_complete_releases_waiter() {
        let gate = Arc::new(LoginGate::new());
        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.wait(Duration::from_secs(5)).await })
        };
        while !gate.is_waiting() {
            tokio::task::yield_now().await;
        }
        assert!(gate.complete(true));
        assert!(waiter.await.unwrap());
        assert!(!gate.is_waiting());
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let gate = LoginGate::new();
        assert!(!gate.wait(Duration::from_millis(20)).await);
        assert!(!gate.is_waiting());
    }

    #[test]
    fn test_complete_without_waiter() {
        assert!(!LoginGate::new().complete(true));
    }
}
