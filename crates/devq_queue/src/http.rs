//! REST client for a remote queue service.
//!
//! Contract:
//!
//! ```text
//! POST /jobs                            {runId, jobs[]}     -> 2xx
//! GET  /jobs/next?worker={id}                               -> 200 Job | 204
//! POST /jobs/{jobId}/result             {outcome}           -> 200 (idempotent)
//! GET  /runs/{runId}/results?after={n}                      -> 200 {outcomes[], next}
//! POST /runs/{runId}/close                                  -> 2xx
//! ```
//!
//! Transport failures and unexpected statuses surface as [QueueError::Unavailable].

use std::time::Duration;

use async_trait::async_trait;
use devq_utils::protocol::{
    EnqueueRequest, Job, JobId, Outcome, ReportOutcomeRequest, ResultsPage, RunId, WorkerId,
};
use reqwest::{StatusCode, Url};
use tracing::instrument;

use crate::{JobSource, QueueError};

/// How long a single request to the queue may take before it is considered failed.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct HttpJobSource {
    base: Url,
    client: reqwest::Client,
}

impl HttpJobSource {
    pub fn new(base_url: impl AsRef<str>) -> Result<Self, QueueError> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl AsRef<str>, timeout: Duration) -> Result<Self, QueueError> {
        let base = Url::parse(base_url.as_ref())
            .map_err(|e| QueueError::InvalidUrl(format!("{}: {e}", base_url.as_ref())))?;
        if base.cannot_be_a_base() {
            return Err(QueueError::InvalidUrl(base_url.as_ref().to_owned()));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(format!("devq/{}", devq_utils::VERSION))
            .build()
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Ok(Self { base, client })
    }

    /// Joins path segments onto the base URL, escaping each segment.
    fn endpoint<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Url {
        let mut url = self.base.clone();
        {
            // Checked in the constructor that the base can be a base.
            let mut path = url
                .path_segments_mut()
                .expect("illegal state - base URL cannot be a base");
            path.pop_if_empty();
            path.extend(segments);
        }
        url
    }
}

fn expect_success(response: &reqwest::Response) -> Result<(), QueueError> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(QueueError::unexpected_status(status))
    }
}

#[async_trait]
impl JobSource for HttpJobSource {
    #[instrument(level = "debug", skip(self, jobs), fields(num_jobs = jobs.len()))]
    async fn enqueue(&self, run_id: &RunId, jobs: Vec<Job>) -> Result<(), QueueError> {
        let body = EnqueueRequest {
            run_id: run_id.clone(),
            jobs,
        };
        let response = self
            .client
            .post(self.endpoint(["jobs"]))
            .json(&body)
            .send()
            .await?;
        expect_success(&response)
    }

    #[instrument(level = "trace", skip(self))]
    async fn pull_next(&self, worker: &WorkerId) -> Result<Option<Job>, QueueError> {
        let response = self
            .client
            .get(self.endpoint(["jobs", "next"]))
            .query(&[("worker", worker.0.as_str())])
            .send()
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::OK => Ok(Some(response.json().await?)),
            status => Err(QueueError::unexpected_status(status)),
        }
    }

    #[instrument(level = "debug", skip(self, outcome))]
    async fn report_outcome(&self, job_id: &JobId, outcome: Outcome) -> Result<(), QueueError> {
        let response = self
            .client
            .post(self.endpoint(["jobs", job_id.0.as_str(), "result"]))
            .json(&ReportOutcomeRequest { outcome })
            .send()
            .await?;
        expect_success(&response)
    }

    #[instrument(level = "trace", skip(self))]
    async fn results_since(&self, run_id: &RunId, cursor: u64) -> Result<ResultsPage, QueueError> {
        let response = self
            .client
            .get(self.endpoint(["runs", run_id.0.as_str(), "results"]))
            .query(&[("after", cursor)])
            .send()
            .await?;
        expect_success(&response)?;
        Ok(response.json().await?)
    }

    #[instrument(level = "debug", skip(self))]
    async fn close_run(&self, run_id: &RunId) -> Result<(), QueueError> {
        let response = self
            .client
            .post(self.endpoint(["runs", run_id.0.as_str(), "close"]))
            .send()
            .await?;
        expect_success(&response)
    }
}
