//! Data model shared by the queue, the workers, and the run tracker.
//!
//! Everything here crosses the queue's REST boundary, and is serialized as camel-cased JSON.

use std::{fmt, time::Duration};

use serde_derive::{Deserialize, Serialize};

use crate::time::EpochMillis;

/// The attempt number of the first job created for a test case.
pub const INIT_ATTEMPT: u32 = 1;

/// ID of a run, shared by every job created on behalf of that run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn unique() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ID of a single job. A retry of a test case is always a new job, with a fresh ID.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    #[allow(clippy::new_without_default)] // Job IDs should be fresh, not defaulted
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn unique() -> Self {
        Self(format!("worker-{}", uuid::Uuid::new_v4()))
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content identity of a build artifact; the unit of artifact caching.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ArtifactId(pub String);

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a single test: its fully-qualified name, and the component it targets.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub name: String,
    pub component: String,
}

impl TestCase {
    pub fn new(name: impl Into<String>, component: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            component: component.into(),
        }
    }
}

impl fmt::Display for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.component, self.name)
    }
}

/// The key under which running devices are matched against a job's requested configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct DeviceKey {
    pub sdk: u32,
    pub profile: String,
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@sdk{}", self.profile, self.sdk)
    }
}

/// Declarative description of the emulated device a job must run on.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfiguration {
    /// Platform SDK version.
    pub sdk: u32,
    /// Device profile, e.g. "phone" or "tablet".
    pub profile: String,
    /// Emulator image the device is booted from.
    pub emulator_image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sd_card_image: Option<String>,
}

impl DeviceConfiguration {
    pub fn key(&self) -> DeviceKey {
        DeviceKey {
            sdk: self.sdk,
            profile: self.profile.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct BuildArtifact {
    pub id: ArtifactId,
    /// Name the artifact is stored under once fetched, e.g. "app-debug.apk".
    pub file_name: String,
}

/// The application under test, and the application carrying the tests.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct BuildArtifacts {
    pub app: BuildArtifact,
    pub test_app: BuildArtifact,
}

/// One dispatchable attempt to run a test case on a device.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub run_id: RunId,
    pub test_case: TestCase,
    pub device: DeviceConfiguration,
    pub artifacts: BuildArtifacts,
    /// 1-indexed; see [INIT_ATTEMPT].
    pub attempt: u32,
}

impl Job {
    pub fn new(
        run_id: RunId,
        test_case: TestCase,
        device: DeviceConfiguration,
        artifacts: BuildArtifacts,
    ) -> Self {
        Self {
            id: JobId::new(),
            run_id,
            test_case,
            device,
            artifacts,
            attempt: INIT_ATTEMPT,
        }
    }

    /// Creates the job for the next attempt of this job's test case.
    pub fn next_attempt(&self) -> Self {
        Self {
            id: JobId::new(),
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

/// Whether an outcome is a trustworthy result of the test itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeClass {
    /// The device executed the test and produced a definitive result.
    TestResult,
    /// Execution did not produce a trustworthy result; a candidate for retry.
    InfrastructureError,
}

/// The classified result of one job attempt.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Outcome {
    Passed,
    Failed {
        detail: String,
    },
    Timeout {
        #[serde(rename = "afterMillis")]
        after_millis: u64,
    },
    DeviceUnavailable {
        reason: String,
    },
    CrashedProcess {
        reason: String,
    },
    ArtifactUnavailable {
        artifact: ArtifactId,
        reason: String,
    },
    QueueUnavailable {
        reason: String,
    },
}

impl Outcome {
    pub fn timeout(after: Duration) -> Self {
        Self::Timeout {
            after_millis: after.as_millis() as u64,
        }
    }

    pub fn class(&self) -> OutcomeClass {
        use Outcome::*;
        match self {
            Passed | Failed { .. } => OutcomeClass::TestResult,
            Timeout { .. }
            | DeviceUnavailable { .. }
            | CrashedProcess { .. }
            | ArtifactUnavailable { .. }
            | QueueUnavailable { .. } => OutcomeClass::InfrastructureError,
        }
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, Self::Passed)
    }

    pub fn is_infrastructure_error(&self) -> bool {
        self.class() == OutcomeClass::InfrastructureError
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Passed => write!(f, "passed"),
            Outcome::Failed { detail } => write!(f, "failed: {detail}"),
            Outcome::Timeout { after_millis } => write!(f, "timed out after {after_millis}ms"),
            Outcome::DeviceUnavailable { reason } => write!(f, "device unavailable: {reason}"),
            Outcome::CrashedProcess { reason } => write!(f, "process crashed: {reason}"),
            Outcome::ArtifactUnavailable { artifact, reason } => {
                write!(f, "artifact {artifact} unavailable: {reason}")
            }
            Outcome::QueueUnavailable { reason } => write!(f, "queue unavailable: {reason}"),
        }
    }
}

/// An outcome, as recorded by the queue for a job.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReportedOutcome {
    pub job_id: JobId,
    pub run_id: RunId,
    pub outcome: Outcome,
    pub reported_at: EpochMillis,
}

/// Body of `POST /jobs`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    pub run_id: RunId,
    pub jobs: Vec<Job>,
}

/// Body of `POST /jobs/{jobId}/result`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReportOutcomeRequest {
    pub outcome: Outcome,
}

/// Response of `GET /runs/{runId}/results?after={cursor}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResultsPage {
    pub outcomes: Vec<ReportedOutcome>,
    /// The cursor to pass to fetch outcomes recorded after this page.
    pub next: u64,
}
