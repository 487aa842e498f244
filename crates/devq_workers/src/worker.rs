//! The worker loop.
//!
//! ```text
//! Idle -> AwaitingJob -> Provisioning -> Executing -> Reporting -> Idle
//!                 \             \________________________/
//!                  \                 (infrastructure error)
//!                   `-> ShuttingDown
//! ```

use std::time::Duration;

use devq_queue::SharedJobSource;
use devq_utils::{
    decay::ExpDecay,
    log_assert,
    oneshot_notify::OneshotRx,
    protocol::{Job, Outcome, WorkerId},
    retry::async_retry_n,
    timeout_future::{TimedOut, TimeoutFuture},
};
use tokio::time::Instant;
use tracing::Instrument;

use crate::{
    artifacts::ArtifactFetcher,
    device::{DeviceDriver, DeviceHealth, DeviceLifecycleManager, RawExecutionResult},
    DEFAULT_PROVISION_TIMEOUT, DEFAULT_TEST_TIMEOUT,
};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: WorkerId,
    /// Hard limit on a single test execution.
    pub test_timeout: Duration,
    /// Limit on starting a device.
    pub provision_timeout: Duration,
    /// How long the worker keeps polling an empty queue before concluding its pool is exhausted.
    /// `None` polls forever.
    pub idle_grace_period: Option<Duration>,
    pub pull_backoff: ExpDecay,
    /// Attempts at reporting a single outcome before giving up on it.
    pub report_attempts: usize,
    pub report_backoff: ExpDecay,
    /// Consecutive failures to provision a device after which the worker stops. At least 1; with
    /// 0, the first failure would already be fatal.
    pub max_consecutive_device_failures: usize,
}

impl WorkerConfig {
    pub fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            test_timeout: DEFAULT_TEST_TIMEOUT,
            provision_timeout: DEFAULT_PROVISION_TIMEOUT,
            idle_grace_period: Some(Duration::from_secs(60)),
            pull_backoff: ExpDecay::quadratic(Duration::from_millis(250), Duration::from_secs(5)),
            report_attempts: 5,
            report_backoff: ExpDecay::quadratic(
                Duration::from_millis(200),
                Duration::from_secs(5),
            ),
            max_consecutive_device_failures: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    AwaitingJob,
    Provisioning,
    Executing,
    Reporting,
    ShuttingDown,
}

impl WorkerState {
    fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Idle, AwaitingJob)
                | (AwaitingJob, Provisioning)
                | (Provisioning, Executing)
                | (Provisioning, Reporting)
                | (Executing, Reporting)
                | (Reporting, Idle)
                | (Reporting, ShuttingDown)
                | (Idle, ShuttingDown)
                | (AwaitingJob, ShuttingDown)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExitStatus {
    /// No job arrived within the idle grace period.
    Exhausted,
    ShutdownRequested,
    /// Devices could not be provisioned, repeatedly.
    DeviceFailure(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct WorkerExit {
    pub status: WorkerExitStatus,
    pub jobs_handled: usize,
    /// Outcomes that could not be delivered to the queue.
    pub reports_dropped: usize,
}

/// Result of taking one job through provisioning and execution.
struct Attempted {
    outcome: Outcome,
    /// Set if the worker cannot go on after reporting this outcome.
    fatal: Option<String>,
}

pub struct Worker<D: DeviceDriver> {
    config: WorkerConfig,
    source: SharedJobSource,
    devices: DeviceLifecycleManager<D>,
    artifacts: ArtifactFetcher,
    state: WorkerState,
    consecutive_device_failures: usize,
    jobs_handled: usize,
    reports_dropped: usize,
}

impl<D: DeviceDriver> Worker<D> {
    pub fn new(
        config: WorkerConfig,
        source: SharedJobSource,
        driver: D,
        artifacts: ArtifactFetcher,
    ) -> Self {
        let devices = DeviceLifecycleManager::new(driver, config.provision_timeout);
        Self {
            config,
            source,
            devices,
            artifacts,
            state: WorkerState::Idle,
            consecutive_device_failures: 0,
            jobs_handled: 0,
            reports_dropped: 0,
        }
    }

    fn transition(&mut self, next: WorkerState) {
        log_assert!(
            self.state.can_transition_to(next),
            from = ?self.state,
            to = ?next,
            "illegal worker state transition"
        );
        tracing::trace!(from = ?self.state, to = ?next, "worker state");
        self.state = next;
    }

    /// Pulls and handles jobs until the pool is exhausted, shutdown is requested, or devices
    /// become unusable. A job already in flight when shutdown is requested is finished first.
    pub async fn run(mut self, mut shutdown: OneshotRx) -> WorkerExit {
        let worker_id = self.config.worker_id.clone();
        tracing::info!(%worker_id, "worker started");

        let status = loop {
            self.transition(WorkerState::AwaitingJob);
            let job = match self.await_job(&mut shutdown).await {
                Ok(job) => job,
                Err(status) => break status,
            };

            let span = tracing::info_span!(
                "job",
                %worker_id,
                job_id = %job.id,
                run_id = %job.run_id,
                test = %job.test_case,
                attempt = job.attempt,
            );
            let fatal = self.handle_job(job).instrument(span).await;
            self.jobs_handled += 1;

            if let Some(reason) = fatal {
                tracing::error!(%worker_id, %reason, "worker cannot continue");
                break WorkerExitStatus::DeviceFailure(reason);
            }
            self.transition(WorkerState::Idle);
        };

        self.transition(WorkerState::ShuttingDown);
        self.devices.shutdown().await;

        tracing::info!(
            %worker_id,
            ?status,
            jobs_handled = self.jobs_handled,
            reports_dropped = self.reports_dropped,
            "worker exiting"
        );
        WorkerExit {
            status,
            jobs_handled: self.jobs_handled,
            reports_dropped: self.reports_dropped,
        }
    }

    async fn await_job(&mut self, shutdown: &mut OneshotRx) -> Result<Job, WorkerExitStatus> {
        let mut backoff = self.config.pull_backoff;
        let waiting_since = Instant::now();

        loop {
            if shutdown.is_notified() {
                return Err(WorkerExitStatus::ShutdownRequested);
            }

            match self.source.pull_next(&self.config.worker_id).await {
                Ok(Some(job)) => return Ok(job),
                Ok(None) => tracing::trace!("no job available"),
                Err(error) => tracing::warn!(%error, "failed to pull next job"),
            }

            if let Some(grace) = self.config.idle_grace_period {
                if waiting_since.elapsed() >= grace {
                    tracing::info!(?grace, "no job arrived within the grace period");
                    return Err(WorkerExitStatus::Exhausted);
                }
            }

            let wait = backoff.next_duration();
            tokio::select! {
                _ = &mut *shutdown => return Err(WorkerExitStatus::ShutdownRequested),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Takes a job through to a reported outcome. Returns a reason if the worker must stop.
    async fn handle_job(&mut self, job: Job) -> Option<String> {
        self.transition(WorkerState::Provisioning);
        let Attempted { outcome, fatal } = self.attempt(&job).await;

        self.transition(WorkerState::Reporting);
        tracing::info!(%outcome, "job finished");
        self.report(&job, outcome).await;

        fatal
    }

    async fn attempt(&mut self, job: &Job) -> Attempted {
        let local_artifacts = match self.artifacts.ensure(&job.artifacts).await {
            Ok(local) => local,
            Err(error) => {
                tracing::warn!(%error, "failed to fetch artifacts");
                return Attempted {
                    outcome: Outcome::ArtifactUnavailable {
                        artifact: error.artifact().clone(),
                        reason: error.to_string(),
                    },
                    fatal: None,
                };
            }
        };

        let lease = match self.devices.acquire(&job.device).await {
            Ok(lease) => {
                self.consecutive_device_failures = 0;
                lease
            }
            Err(error) => {
                self.consecutive_device_failures += 1;
                tracing::warn!(
                    %error,
                    consecutive_failures = self.consecutive_device_failures,
                    "failed to provision device"
                );
                let fatal = (self.consecutive_device_failures
                    >= self.config.max_consecutive_device_failures)
                    .then(|| {
                        format!(
                            "{} consecutive device provisioning failures, last: {error}",
                            self.consecutive_device_failures
                        )
                    });
                return Attempted {
                    outcome: Outcome::DeviceUnavailable {
                        reason: error.to_string(),
                    },
                    fatal,
                };
            }
        };

        self.transition(WorkerState::Executing);
        let timeout = self.config.test_timeout;
        let execution = self.devices.driver().execute(
            lease.handle(),
            &job.test_case,
            &local_artifacts,
            timeout,
        );
        let executed = TimeoutFuture::new(execution, timeout).wait().await;

        let (outcome, health) = match executed {
            Ok(Ok(RawExecutionResult::Passed)) => (Outcome::Passed, DeviceHealth::Healthy),
            Ok(Ok(RawExecutionResult::Failed { detail })) => {
                (Outcome::Failed { detail }, DeviceHealth::Healthy)
            }
            Ok(Ok(RawExecutionResult::Crashed { detail })) => {
                (Outcome::CrashedProcess { reason: detail }, DeviceHealth::Healthy)
            }
            Ok(Err(error)) => {
                tracing::warn!(%error, "device failed during execution");
                (
                    Outcome::DeviceUnavailable {
                        reason: error.to_string(),
                    },
                    DeviceHealth::Corrupted,
                )
            }
            Err(TimedOut { after }) => {
                tracing::warn!(?after, "test execution timed out");
                (Outcome::timeout(after), DeviceHealth::Corrupted)
            }
        };

        self.devices.release(lease, health).await;
        Attempted {
            outcome,
            fatal: None,
        }
    }

    async fn report(&mut self, job: &Job, outcome: Outcome) {
        let source = &self.source;
        let reported = async_retry_n(
            self.config.report_attempts,
            self.config.report_backoff,
            |attempt| {
                let outcome = outcome.clone();
                async move {
                    let result = source.report_outcome(&job.id, outcome).await;
                    if let Err(error) = &result {
                        tracing::warn!(%error, attempt, "failed to report outcome");
                    }
                    result
                }
            },
        )
        .await;

        if let Err(error) = reported {
            // The queue never learns of this attempt; the run will consider the test lost.
            tracing::error!(
                %error,
                attempts = self.config.report_attempts,
                "giving up on reporting outcome"
            );
            self.reports_dropped += 1;
        }
    }
}
