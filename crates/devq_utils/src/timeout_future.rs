use std::{future::Future, time::Duration};

/// A wrapper around a future that implements timing-out of that future.
pub struct TimeoutFuture<F: Future> {
    fut: F,
    timeout: Duration,
}

/// The wrapped future did not complete in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("timed out after {after:?}")]
pub struct TimedOut {
    pub after: Duration,
}

impl<F: Future> TimeoutFuture<F> {
    pub fn new(fut: F, timeout: Duration) -> Self {
        Self { fut, timeout }
    }

    /// Waits for the future to complete. Returns [TimedOut] if the timeout elapses first, in
    /// which case the future is dropped.
    ///
    /// **Not** cancel-safe.
    pub async fn wait(self) -> Result<F::Output, TimedOut> {
        tokio::select! {
            r = self.fut => {
                Ok(r)
            }
            _ = tokio::time::sleep(self.timeout) => {
                Err(TimedOut { after: self.timeout })
            }
        }
    }
}
