//! Accounting of a run's test cases against reported outcomes.
//!
//! The tracker never asks workers anything. A test case is resolved by an outcome reported for
//! its current job; whatever is unresolved when the run finishes is lost.

use std::collections::HashMap;

use devq_utils::{
    illegal_state,
    protocol::{
        BuildArtifacts, DeviceConfiguration, Job, JobId, Outcome, ReportedOutcome, RunId,
        TestCase, INIT_ATTEMPT,
    },
};

use crate::result::{FailedTest, LostReason, LostTest, PassedTest, RunResult};

/// A test case the run intends to execute, and the device it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedTest {
    pub test_case: TestCase,
    pub device: DeviceConfiguration,
}

/// The immutable set of test cases submitted together.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub run_id: RunId,
    pub tests: Vec<PlannedTest>,
    pub artifacts: BuildArtifacts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed per test case, beyond its first attempt.
    pub retry_budget: u32,
    /// Whether a definitive test failure is retried too, rather than only infrastructure errors.
    pub retry_failed_tests: bool,
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        INIT_ATTEMPT + self.retry_budget
    }

    fn may_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts()
    }
}

/// What accounting a reported outcome did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accounted {
    /// The report changed nothing.
    Ignored(IgnoredReport),
    /// The test case reached a terminal state.
    Resolved(TestCase),
    /// The test case needs another attempt; the job must be dispatched.
    Retry(Job),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoredReport {
    WrongRun,
    UnknownJob,
    /// The job's test case already moved past it.
    Duplicate,
    AfterFinalization,
}

#[derive(Debug, Clone)]
enum Resolution {
    Passed,
    Failed { detail: String },
    Lost(LostReason),
}

#[derive(Debug)]
struct TestState {
    /// The latest job dispatched for this test case.
    current: Job,
    /// Reported outcomes, in attempt order.
    history: Vec<Outcome>,
    resolution: Option<Resolution>,
}

impl TestState {
    fn last_failure(&self) -> Option<&str> {
        self.history.iter().rev().find_map(|outcome| match outcome {
            Outcome::Failed { detail } => Some(detail.as_str()),
            _ => None,
        })
    }
}

#[derive(Debug)]
pub struct RunTracker {
    run_id: RunId,
    policy: RetryPolicy,
    tests: Vec<TestState>,
    /// Every job ever dispatched, to the index of its test case.
    jobs: HashMap<JobId, usize>,
    unresolved: usize,
    finalized: bool,
}

impl RunTracker {
    /// Creates the tracker and the first-attempt jobs of every planned test case.
    /// Repeated test cases in the plan are tracked once.
    pub fn new(plan: RunPlan, policy: RetryPolicy) -> (Self, Vec<Job>) {
        let RunPlan {
            run_id,
            tests,
            artifacts,
        } = plan;

        let mut seen = std::collections::HashSet::new();
        let mut states = Vec::with_capacity(tests.len());
        let mut jobs = HashMap::with_capacity(tests.len());
        let mut initial_jobs = Vec::with_capacity(tests.len());

        for PlannedTest { test_case, device } in tests {
            if !seen.insert(test_case.clone()) {
                tracing::warn!(
                    %run_id,
                    test = %test_case,
                    "test case planned twice, tracking once"
                );
                continue;
            }
            let job = Job::new(run_id.clone(), test_case, device, artifacts.clone());
            jobs.insert(job.id.clone(), states.len());
            initial_jobs.push(job.clone());
            states.push(TestState {
                current: job,
                history: Vec::new(),
                resolution: None,
            });
        }

        let tracker = Self {
            run_id,
            policy,
            unresolved: states.len(),
            tests: states,
            jobs,
            finalized: false,
        };
        (tracker, initial_jobs)
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn is_complete(&self) -> bool {
        self.unresolved == 0
    }

    pub fn num_unresolved(&self) -> usize {
        self.unresolved
    }

    /// Applies a reported outcome. Reports that cannot be applied are logged and ignored.
    pub fn account(&mut self, reported: &ReportedOutcome) -> Accounted {
        let ignored = |reason: IgnoredReport| {
            tracing::debug!(job_id = %reported.job_id, ?reason, "ignoring report");
            Accounted::Ignored(reason)
        };

        if self.finalized {
            tracing::info!(
                job_id = %reported.job_id,
                outcome = %reported.outcome,
                "dropping report for a finalized run"
            );
            return Accounted::Ignored(IgnoredReport::AfterFinalization);
        }
        if reported.run_id != self.run_id {
            return ignored(IgnoredReport::WrongRun);
        }
        let Some(&index) = self.jobs.get(&reported.job_id) else {
            tracing::warn!(
                run_id = %self.run_id,
                job_id = %reported.job_id,
                "report for a job this run never dispatched"
            );
            return Accounted::Ignored(IgnoredReport::UnknownJob);
        };

        let policy = self.policy;
        let state = &mut self.tests[index];
        if state.resolution.is_some() || state.current.id != reported.job_id {
            return ignored(IgnoredReport::Duplicate);
        }

        let outcome = reported.outcome.clone();
        let attempt = state.current.attempt;
        let test_case = state.current.test_case.clone();
        tracing::debug!(test = %test_case, attempt, %outcome, "accounting outcome");
        state.history.push(outcome.clone());

        let retryable = match &outcome {
            Outcome::Passed => false,
            Outcome::Failed { .. } => policy.retry_failed_tests,
            _ => true,
        };

        if retryable && policy.may_retry(attempt) {
            let retry = state.current.next_attempt();
            tracing::info!(
                test = %test_case,
                attempt = retry.attempt,
                previous = %outcome,
                "retrying test"
            );
            state.current = retry.clone();
            self.jobs.insert(retry.id.clone(), index);
            return Accounted::Retry(retry);
        }

        let resolution = match outcome {
            Outcome::Passed => Resolution::Passed,
            Outcome::Failed { detail } => Resolution::Failed { detail },
            // Out of attempts. An earlier definitive failure still counts.
            _ => match state.last_failure() {
                Some(detail) => Resolution::Failed {
                    detail: detail.to_owned(),
                },
                None => Resolution::Lost(LostReason::RetriesExhausted),
            },
        };
        self.resolve(index, resolution);
        Accounted::Resolved(test_case)
    }

    /// Records that a retry job could not be handed to the queue. Its test case is lost.
    pub fn dispatch_failed(&mut self, job_id: &JobId, detail: String) {
        let Some(&index) = self.jobs.get(job_id) else {
            illegal_state!("dispatch failure for an untracked job", %job_id);
            return;
        };
        if self.tests[index].resolution.is_some() {
            return;
        }
        tracing::warn!(
            test = %self.tests[index].current.test_case,
            %detail,
            "failed to dispatch retry"
        );
        self.resolve(index, Resolution::Lost(LostReason::DispatchFailed { detail }));
    }

    fn resolve(&mut self, index: usize, resolution: Resolution) {
        let state = &mut self.tests[index];
        if state.resolution.is_some() {
            illegal_state!("resolving a test case twice", test = %state.current.test_case);
            return;
        }
        state.resolution = Some(resolution);
        self.unresolved -= 1;
    }

    /// Concludes the run. Every test case without a terminal outcome is lost.
    pub fn finalize(&mut self, timed_out: bool) -> RunResult {
        self.finalized = true;

        let mut passed = Vec::new();
        let mut failed = Vec::new();
        let mut lost = Vec::new();

        for state in &self.tests {
            let test_case = state.current.test_case.clone();
            let attempts = state.history.len() as u32;
            match &state.resolution {
                Some(Resolution::Passed) => passed.push(PassedTest {
                    test_case,
                    attempts,
                    flaky: attempts > 1,
                }),
                Some(Resolution::Failed { detail }) => failed.push(FailedTest {
                    test_case,
                    attempts,
                    detail: detail.clone(),
                }),
                Some(Resolution::Lost(reason)) => lost.push(LostTest {
                    test_case,
                    attempts,
                    reason: reason.clone(),
                    last_outcome: state.history.last().cloned(),
                }),
                None => lost.push(LostTest {
                    test_case,
                    attempts,
                    reason: LostReason::NeverReported,
                    last_outcome: state.history.last().cloned(),
                }),
            }
        }

        let result = RunResult::new(self.run_id.clone(), passed, failed, lost, timed_out);
        tracing::info!(
            run_id = %self.run_id,
            verdict = ?result.verdict,
            passed = result.passed.len(),
            failed = result.failed.len(),
            lost = result.lost.len(),
            timed_out,
            "run finalized"
        );
        result
    }
}
