use std::sync::Arc;

use async_trait::async_trait;
use devq_utils::protocol::{Job, JobId, Outcome, ResultsPage, RunId, WorkerId};

use crate::QueueError;

/// The queue protocol, as seen by its clients.
///
/// No ordering is guaranteed across jobs. Implementations must tolerate a worker claiming a job
/// and never reporting it.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Registers `jobs` for pulling under `run_id`. Either all jobs are registered or, on error,
    /// none are.
    async fn enqueue(&self, run_id: &RunId, jobs: Vec<Job>) -> Result<(), QueueError>;

    /// Claims the next unclaimed job for `worker`, or `None` if there is none right now.
    /// Never blocks waiting for work; callers poll with backoff.
    async fn pull_next(&self, worker: &WorkerId) -> Result<Option<Job>, QueueError>;

    /// Records the outcome of a job. Idempotent: reporting the same job twice is acknowledged
    /// both times, and only the first outcome is recorded.
    async fn report_outcome(&self, job_id: &JobId, outcome: Outcome) -> Result<(), QueueError>;

    /// Fetches outcomes recorded for `run_id` after `cursor`, in recording order.
    async fn results_since(&self, run_id: &RunId, cursor: u64) -> Result<ResultsPage, QueueError>;

    /// Marks a run finalized. Its remaining unclaimed jobs are never handed out, and further
    /// reports for it are acknowledged but dropped.
    async fn close_run(&self, run_id: &RunId) -> Result<(), QueueError>;
}

pub type SharedJobSource = Arc<dyn JobSource>;
