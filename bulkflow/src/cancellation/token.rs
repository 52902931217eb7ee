//! Cancellation token for the retry and poll waits.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// A token for cooperative cancellation.
///
/// Cancellation is idempotent; only the first reason is kept. Waiters
/// blocked in [`CancellationToken::cancelled`] wake as soon as it fires.
#[derive(Default)]
pub struct CancellationToken {
    cancelled: AtomicBool,
    /// First reason wins.
    reason: RwLock<Option<String>>,
    notify: Notify,
}

impl CancellationToken {
    /// Creates a new cancellation token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation with a reason.
    pub fn cancel(&self, reason: impl Into<String>) {
        if self
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let reason = reason.into();
            tracing::debug!(reason = %reason, "Cancellation requested");
            *self.reason.write() = Some(reason);
            self.notify.notify_waiters();
        }
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    /// Completes once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent cancel is not missed.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Cancels the token once `after` has elapsed.
    ///
    /// The timer task is detached; dropping the returned handle does not stop it.
    pub fn cancel_after(
        self: &Arc<Self>,
        after: Duration,
        reason: impl Into<String>,
    ) -> tokio::task::JoinHandle<()> {
        let token = Arc::clone(self);
        let reason = reason.into();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(after) => token.cancel(reason),
                () = token.cancelled() => {}
            }
        })
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[test]
    fn test_token_default_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.reason().is_none());
    }

    #[test]
    fn test_token_cancel_idempotent() {
        let token = CancellationToken::new();
        token.cancel("First reason");
        token.cancel("Second reason");

        assert!(token.is_cancelled());
        assert_eq!(token.reason(), Some("First reason".to_string()));
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel("done");
        tokio_test::assert_ready!(tokio_test::task::spawn(token.cancelled()).poll());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = Arc::new(CancellationToken::new());
        let waiter = {
            let token = Arc::clone(&token);
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::task::yield_now().await;
        token.cancel("stop");
        waiter.await.unwrap();
        assert_eq!(token.reason().as_deref(), Some("stop"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_fires_at_deadline() {
        let token = Arc::new(CancellationToken::new());
        let start = Instant::now();
        token.cancel_after(Duration::from_secs(30), "deadline");

        token.cancelled().await;
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert_eq!(token.reason().as_deref(), Some("deadline"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_keeps_earlier_reason() {
        let token = Arc::new(CancellationToken::new());
        let timer = token.cancel_after(Duration::from_secs(30), "deadline");
        token.cancel("caller");
        timer.await.unwrap();
        assert_eq!(token.reason().as_deref(), Some("caller"));
    }
}
