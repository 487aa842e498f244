//! The run result: one verdict, with every intended test case accounted for as passed, failed,
//! or lost.

use devq_utils::{
    exit::ExitCode,
    protocol::{Outcome, RunId, TestCase},
    time::EpochMillis,
};
use serde_derive::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Verdict {
    Success,
    Failure,
}

impl Verdict {
    pub fn exit_code(self) -> ExitCode {
        match self {
            Verdict::Success => ExitCode::SUCCESS,
            Verdict::Failure => ExitCode::FAILURE,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PassedTest {
    pub test_case: TestCase,
    pub attempts: u32,
    /// Passed only after an earlier attempt did not.
    pub flaky: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FailedTest {
    pub test_case: TestCase,
    pub attempts: u32,
    /// Detail of the last definitive failure.
    pub detail: String,
}

/// Why a test case has no terminal outcome.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "reason", rename_all = "camelCase")]
pub enum LostReason {
    /// A job was outstanding when the run finished.
    NeverReported,
    /// Every allowed attempt ended in an infrastructure error.
    RetriesExhausted,
    /// A retry could not be handed to the queue.
    DispatchFailed { detail: String },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LostTest {
    pub test_case: TestCase,
    /// Attempts that were reported, of any outcome.
    pub attempts: u32,
    #[serde(flatten)]
    pub reason: LostReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_outcome: Option<Outcome>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[must_use]
pub struct RunResult {
    pub run_id: RunId,
    pub verdict: Verdict,
    pub passed: Vec<PassedTest>,
    pub failed: Vec<FailedTest>,
    pub lost: Vec<LostTest>,
    /// The run-level timeout elapsed before every test case resolved.
    pub timed_out: bool,
    /// The run was cancelled before every test case resolved.
    #[serde(default)]
    pub cancelled: bool,
    pub finished_at: EpochMillis,
}

impl RunResult {
    /// Assembles a result, deciding the verdict: success iff nothing failed and nothing was lost.
    pub fn new(
        run_id: RunId,
        mut passed: Vec<PassedTest>,
        mut failed: Vec<FailedTest>,
        mut lost: Vec<LostTest>,
        timed_out: bool,
    ) -> Self {
        passed.sort_by(|a, b| a.test_case.cmp(&b.test_case));
        failed.sort_by(|a, b| a.test_case.cmp(&b.test_case));
        lost.sort_by(|a, b| a.test_case.cmp(&b.test_case));

        let verdict = if failed.is_empty() && lost.is_empty() {
            Verdict::Success
        } else {
            Verdict::Failure
        };

        Self {
            run_id,
            verdict,
            passed,
            failed,
            lost,
            timed_out,
            cancelled: false,
            finished_at: EpochMillis::now(),
        }
    }

    pub fn num_tests(&self) -> usize {
        self.passed.len() + self.failed.len() + self.lost.len()
    }

    pub fn flaky(&self) -> impl Iterator<Item = &PassedTest> {
        self.passed.iter().filter(|p| p.flaky)
    }

    /// How many attempts of `test_case` were reported.
    pub fn attempts_of(&self, test_case: &TestCase) -> Option<u32> {
        let passed = self.passed.iter().find(|t| &t.test_case == test_case);
        let failed = self.failed.iter().find(|t| &t.test_case == test_case);
        let lost = self.lost.iter().find(|t| &t.test_case == test_case);
        passed
            .map(|t| t.attempts)
            .or_else(|| failed.map(|t| t.attempts))
            .or_else(|| lost.map(|t| t.attempts))
    }
}
