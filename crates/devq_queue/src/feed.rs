//! Streams a run's reported outcomes from the queue into a bounded, in-process channel.

use std::time::Duration;

use devq_utils::{
    decay::ExpDecay,
    protocol::{ReportedOutcome, RunId},
};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::SharedJobSource;

/// How often the queue is polled for new outcomes while it is reachable.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// How many outcomes may be buffered before the feed waits on its consumer.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(10);

/// A background poller of a run's outcomes. Dropping the feed stops polling.
pub struct OutcomeFeed {
    handle: JoinHandle<()>,
}

impl OutcomeFeed {
    /// Starts polling `source` for outcomes of `run_id`, delivering them in recording order.
    pub fn start(
        source: SharedJobSource,
        run_id: RunId,
        poll_interval: Duration,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<ReportedOutcome>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = tokio::spawn(poll_outcomes(source, run_id, poll_interval, tx));
        (Self { handle }, rx)
    }
}

impl Drop for OutcomeFeed {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn poll_outcomes(
    source: SharedJobSource,
    run_id: RunId,
    poll_interval: Duration,
    tx: mpsc::Sender<ReportedOutcome>,
) {
    let mut cursor = 0;
    let mut error_backoff = ExpDecay::quadratic(poll_interval, MAX_ERROR_BACKOFF);

    loop {
        match source.results_since(&run_id, cursor).await {
            Ok(page) => {
                error_backoff.reset();
                cursor = page.next;
                for outcome in page.outcomes {
                    if tx.send(outcome).await.is_err() {
                        tracing::debug!(%run_id, "outcome consumer went away, stopping feed");
                        return;
                    }
                }
                tokio::time::sleep(poll_interval).await;
            }
            Err(error) => {
                let wait = error_backoff.next_duration();
                tracing::warn!(%run_id, %error, ?wait, "failed to poll outcomes, backing off");
                tokio::time::sleep(wait).await;
            }
        }

        if tx.is_closed() {
            return;
        }
    }
}
