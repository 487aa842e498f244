//! In-process stand-ins for devices and artifact stores.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    path::Path,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use devq_utils::protocol::{ArtifactId, BuildArtifact, DeviceConfiguration, DeviceKey, TestCase};
use parking_lot::Mutex;

use crate::{
    artifacts::{ArtifactError, ArtifactSource},
    device::{DeviceDriver, DeviceError, LocalArtifacts, RawExecutionResult},
};

/// What a scripted device does when asked to run a test.
#[derive(Debug, Clone)]
pub enum Script {
    Pass,
    Fail(String),
    Crash(String),
    /// Never finishes.
    Hang,
    /// The device stops responding.
    Unresponsive,
    /// Passes after the given time.
    Delay(Duration),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverStats {
    pub started: usize,
    pub stopped: usize,
    /// Most device instances alive at once.
    pub max_live: usize,
    /// Tests executed, in order, with the instance they ran on.
    pub executions: Vec<(TestCase, u64)>,
}

#[derive(Debug)]
pub struct ScriptedDevice {
    pub instance: u64,
    pub key: DeviceKey,
}

#[derive(Default)]
struct DriverState {
    next_instance: u64,
    live: usize,
    failing_acquires: usize,
    hanging_acquires: usize,
    scripts: HashMap<String, VecDeque<Script>>,
    stats: DriverStats,
}

/// A [DeviceDriver] whose tests behave as scripted per test name. Unscripted tests pass.
#[derive(Clone, Default)]
pub struct ScriptedDriver {
    state: Arc<Mutex<DriverState>>,
}

impl ScriptedDriver {
    /// Queues behaviors for successive executions of `test_name`.
    pub fn script(&self, test_name: &str, scripts: impl IntoIterator<Item = Script>) {
        self.state
            .lock()
            .scripts
            .entry(test_name.to_owned())
            .or_default()
            .extend(scripts);
    }

    pub fn fail_next_acquires(&self, n: usize) {
        self.state.lock().failing_acquires += n;
    }

    pub fn hang_next_acquires(&self, n: usize) {
        self.state.lock().hanging_acquires += n;
    }

    pub fn stats(&self) -> DriverStats {
        self.state.lock().stats.clone()
    }

    /// Names of the tests executed so far, in order.
    pub fn executed_tests(&self) -> Vec<String> {
        let state = self.state.lock();
        state
            .stats
            .executions
            .iter()
            .map(|(test, _)| test.name.clone())
            .collect()
    }
}

enum AcquireBehavior {
    Fail,
    Hang,
    Start,
}

#[async_trait]
impl DeviceDriver for ScriptedDriver {
    type Handle = ScriptedDevice;

    async fn acquire(&self, config: &DeviceConfiguration) -> Result<ScriptedDevice, DeviceError> {
        let behavior = {
            let mut state = self.state.lock();
            if state.failing_acquires > 0 {
                state.failing_acquires -= 1;
                AcquireBehavior::Fail
            } else if state.hanging_acquires > 0 {
                state.hanging_acquires -= 1;
                AcquireBehavior::Hang
            } else {
                AcquireBehavior::Start
            }
        };

        match behavior {
            AcquireBehavior::Fail => Err(DeviceError::StartFailed {
                key: config.key(),
                reason: "scripted start failure".to_owned(),
            }),
            AcquireBehavior::Hang => futures::future::pending().await,
            AcquireBehavior::Start => {
                let mut state = self.state.lock();
                state.next_instance += 1;
                state.live += 1;
                state.stats.started += 1;
                state.stats.max_live = state.stats.max_live.max(state.live);
                Ok(ScriptedDevice {
                    instance: state.next_instance,
                    key: config.key(),
                })
            }
        }
    }

    async fn release(&self, _handle: ScriptedDevice) {
        let mut state = self.state.lock();
        state.live -= 1;
        state.stats.stopped += 1;
    }

    async fn execute(
        &self,
        handle: &ScriptedDevice,
        test: &TestCase,
        _artifacts: &LocalArtifacts,
        _timeout: Duration,
    ) -> Result<RawExecutionResult, DeviceError> {
        let script = {
            let mut state = self.state.lock();
            state
                .stats
                .executions
                .push((test.clone(), handle.instance));
            state
                .scripts
                .get_mut(&test.name)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Script::Pass)
        };

        match script {
            Script::Pass => Ok(RawExecutionResult::Passed),
            Script::Fail(detail) => Ok(RawExecutionResult::Failed { detail }),
            Script::Crash(detail) => Ok(RawExecutionResult::Crashed { detail }),
            Script::Hang => futures::future::pending().await,
            Script::Unresponsive => Err(DeviceError::Unresponsive("scripted".to_owned())),
            Script::Delay(wait) => {
                tokio::time::sleep(wait).await;
                Ok(RawExecutionResult::Passed)
            }
        }
    }
}

#[derive(Default)]
struct ArtifactsState {
    downloads: usize,
    unavailable: HashSet<ArtifactId>,
}

/// An [ArtifactSource] that writes placeholder contents, counting downloads.
#[derive(Clone, Default)]
pub struct StaticArtifacts {
    state: Arc<Mutex<ArtifactsState>>,
}

impl StaticArtifacts {
    pub fn downloads(&self) -> usize {
        self.state.lock().downloads
    }

    pub fn make_unavailable(&self, id: ArtifactId) {
        self.state.lock().unavailable.insert(id);
    }

    pub fn make_available(&self, id: &ArtifactId) {
        self.state.lock().unavailable.remove(id);
    }
}

#[async_trait]
impl ArtifactSource for StaticArtifacts {
    async fn download(&self, artifact: &BuildArtifact, dest: &Path) -> Result<(), ArtifactError> {
        if self.state.lock().unavailable.contains(&artifact.id) {
            return Err(ArtifactError::Unavailable {
                artifact: artifact.id.clone(),
                reason: "not found".to_owned(),
            });
        }
        tokio::fs::write(dest, format!("contents of {}", artifact.id))
            .await
            .map_err(|e| ArtifactError::Io {
                artifact: artifact.id.clone(),
                reason: e.to_string(),
            })?;
        self.state.lock().downloads += 1;
        Ok(())
    }
}
