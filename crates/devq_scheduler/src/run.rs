use std::{future::Future, time::Duration};

use devq_queue::{
    feed::{OutcomeFeed, DEFAULT_CHANNEL_CAPACITY, DEFAULT_POLL_INTERVAL},
    QueueError, SharedJobSource,
};
use devq_utils::illegal_state;
use thiserror::Error;
use tokio::time::Instant;

use crate::{
    result::RunResult,
    tracker::{Accounted, RetryPolicy, RunPlan, RunTracker},
};

/// Default limit on a whole run, from submission to verdict.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Limit on closing a concluded run at the queue.
const CLOSE_RUN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub policy: RetryPolicy,
    /// Once elapsed, every unresolved test case is lost.
    pub run_timeout: Duration,
    pub poll_interval: Duration,
    pub feed_capacity: usize,
}

impl RunConfig {
    pub fn new(policy: RetryPolicy, run_timeout: Duration) -> Self {
        Self {
            policy,
            run_timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
            feed_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    /// The run's jobs could not be submitted. No work was started.
    #[error("failed to enqueue the run: {0}")]
    Enqueue(#[source] QueueError),
}

/// Submits `plan` to the queue and follows it to a verdict.
///
/// Fails only if the initial submission fails; from then on, every difficulty is expressed in the
/// result, as lost test cases.
pub async fn execute_run(
    source: SharedJobSource,
    plan: RunPlan,
    config: &RunConfig,
) -> Result<RunResult, RunError> {
    execute_run_until(source, plan, config, std::future::pending()).await
}

/// Like [execute_run], but concludes early once `cancel` resolves. Test cases unresolved at that
/// point are lost, and the run is closed at the queue as usual.
#[tracing::instrument(level = "info", skip_all, fields(run_id = %plan.run_id))]
pub async fn execute_run_until(
    source: SharedJobSource,
    plan: RunPlan,
    config: &RunConfig,
    cancel: impl Future<Output = ()>,
) -> Result<RunResult, RunError> {
    let run_id = plan.run_id.clone();
    let deadline = Instant::now() + config.run_timeout;
    let (mut tracker, initial_jobs) = RunTracker::new(plan, config.policy);
    tokio::pin!(cancel);

    tracing::info!(num_tests = initial_jobs.len(), "submitting run");
    if !initial_jobs.is_empty() {
        source
            .enqueue(&run_id, initial_jobs)
            .await
            .map_err(RunError::Enqueue)?;
    }

    let (feed, mut outcomes) = OutcomeFeed::start(
        source.clone(),
        run_id.clone(),
        config.poll_interval,
        config.feed_capacity,
    );

    let mut ending = Ending::Complete;
    while !tracker.is_complete() {
        let reported = tokio::select! {
            reported = outcomes.recv() => reported,
            _ = tokio::time::sleep_until(deadline) => {
                ending = Ending::TimedOut;
                break;
            }
            _ = &mut cancel => {
                ending = Ending::Cancelled;
                break;
            }
        };

        let Some(reported) = reported else {
            illegal_state!("outcome feed ended before the run completed", %run_id);
            break;
        };

        if let Accounted::Retry(job) = tracker.account(&reported) {
            let job_id = job.id.clone();
            // The deadline and cancellation hold while a retry is in flight to the queue.
            let dispatched = tokio::select! {
                dispatched = source.enqueue(&run_id, vec![job]) => dispatched,
                _ = tokio::time::sleep_until(deadline) => {
                    ending = Ending::TimedOut;
                    break;
                }
                _ = &mut cancel => {
                    ending = Ending::Cancelled;
                    break;
                }
            };
            if let Err(error) = dispatched {
                tracker.dispatch_failed(&job_id, error.to_string());
            }
        }
    }

    match ending {
        Ending::Complete => {}
        Ending::TimedOut => {
            tracing::warn!(unresolved = tracker.num_unresolved(), "run timed out")
        }
        Ending::Cancelled => {
            tracing::warn!(unresolved = tracker.num_unresolved(), "run cancelled")
        }
    }

    drop(feed);
    let mut result = tracker.finalize(ending == Ending::TimedOut);
    result.cancelled = ending == Ending::Cancelled;

    match tokio::time::timeout(CLOSE_RUN_TIMEOUT, source.close_run(&run_id)).await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => tracing::warn!(%error, "failed to close run at the queue"),
        Err(_) => tracing::warn!("timed out closing run at the queue"),
    }

    Ok(result)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    Complete,
    TimedOut,
    Cancelled,
}
