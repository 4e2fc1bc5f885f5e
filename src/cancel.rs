//! Cancellation tokens threaded through every suspending harness call

use crate::error::{HarnessError, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

/// Shared cancellation signal.
///
/// Clones observe the same signal. A child token fires when either itself or
/// any ancestor is cancelled, but cancelling a child never reaches the parent.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    // own signal first, then every ancestor's
    signals: Vec<Arc<watch::Sender<bool>>>,
}

impl CancellationToken {
    /// Create a new non-cancelled token.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            signals: vec![Arc::new(tx)],
        }
    }

    /// Derive a token that is also cancelled when `self` is.
    pub fn child(&self) -> Self {
        let (tx, _rx) = watch::channel(false);
        let mut signals = Vec::with_capacity(self.signals.len() + 1);
        signals.push(Arc::new(tx));
        signals.extend(self.signals.iter().cloned());
        Self { signals }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.signals[0].send_replace(true);
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.signals.iter().any(|s| *s.borrow())
    }

    /// Resolve once the token (or an ancestor) is cancelled.
    pub async fn cancelled(&self) {
        let mut receivers: Vec<_> = self.signals.iter().map(|s| s.subscribe()).collect();
        let waits = receivers.iter_mut().map(|rx| {
            Box::pin(async move {
                // Senders live in `self`, so the channel cannot close while we wait
                let _ = rx.wait_for(|v| *v).await;
            })
        });
        futures::future::select_all(waits).await;
    }

    /// Return `Err(Cancelled)` if the token has fired.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(HarnessError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Race `fut` against `token`, yielding `HarnessError::Cancelled` if the token wins.
pub async fn run_cancellable<F, T>(token: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    token.check()?;
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(HarnessError::Cancelled),
        res = fut => res,
    }
}

/// Sleep for `duration` unless cancelled first.
pub async fn sleep_cancellable(token: &CancellationToken, duration: std::time::Duration) -> Result<()> {
    run_cancellable(token, async {
        tokio::time::sleep(duration).await;
        Ok(())
    })
    .await
}
