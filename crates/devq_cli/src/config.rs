//! TOML configuration files: a worker's settings, and a run's plan.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, ensure, Context};
use devq_scheduler::tracker::{PlannedTest, RunPlan};
use devq_utils::protocol::{
    ArtifactId, BuildArtifact, BuildArtifacts, DeviceConfiguration, RunId, TestCase,
};
use devq_workers::process_driver::ProcessDriverConfig;
use serde_derive::Deserialize;

fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("invalid configuration in {}", path.display()))
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct WorkerSettings {
    #[serde(default = "WorkerSettings::default_test_timeout_secs")]
    pub test_timeout_secs: u64,
    #[serde(default = "WorkerSettings::default_provision_timeout_secs")]
    pub provision_timeout_secs: u64,
    #[serde(default = "WorkerSettings::default_idle_grace_secs")]
    pub idle_grace_secs: u64,
    #[serde(default = "WorkerSettings::default_report_attempts")]
    pub report_attempts: usize,
    #[serde(default = "WorkerSettings::default_max_consecutive_device_failures")]
    pub max_consecutive_device_failures: usize,
}

impl WorkerSettings {
    fn default_test_timeout_secs() -> u64 {
        devq_workers::DEFAULT_TEST_TIMEOUT.as_secs()
    }
    fn default_provision_timeout_secs() -> u64 {
        devq_workers::DEFAULT_PROVISION_TIMEOUT.as_secs()
    }
    fn default_idle_grace_secs() -> u64 {
        60
    }
    fn default_report_attempts() -> usize {
        5
    }
    fn default_max_consecutive_device_failures() -> usize {
        3
    }

    fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.max_consecutive_device_failures >= 1,
            "max-consecutive-device-failures must be at least 1"
        );
        ensure!(self.report_attempts >= 1, "report-attempts must be at least 1");
        Ok(())
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            test_timeout_secs: Self::default_test_timeout_secs(),
            provision_timeout_secs: Self::default_provision_timeout_secs(),
            idle_grace_secs: Self::default_idle_grace_secs(),
            report_attempts: Self::default_report_attempts(),
            max_consecutive_device_failures: Self::default_max_consecutive_device_failures(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ArtifactSettings {
    /// Base URL of the artifact store. Defaults to the queue's URL.
    #[serde(default)]
    pub url: Option<String>,
    pub cache_dir: PathBuf,
}

/// Contents of `devq work --config`.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct WorkerFile {
    #[serde(default)]
    pub worker: WorkerSettings,
    pub artifacts: ArtifactSettings,
    pub driver: ProcessDriverConfig,
}

impl WorkerFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file: Self = read_toml(path)?;
        file.worker
            .validate()
            .with_context(|| format!("invalid worker settings in {}", path.display()))?;
        Ok(file)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct ArtifactEntry {
    id: String,
    file_name: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct ArtifactsEntry {
    app: ArtifactEntry,
    test_app: ArtifactEntry,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct DeviceEntry {
    name: String,
    sdk: u32,
    profile: String,
    emulator_image: String,
    #[serde(default)]
    sd_card_image: Option<String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct TestEntry {
    name: String,
    component: String,
    device: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RunSettings {
    #[serde(default)]
    pub retry_budget: Option<u32>,
    #[serde(default)]
    pub retry_failed_tests: Option<bool>,
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,
}

/// Contents of `devq run --plan`.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct PlanFile {
    #[serde(default)]
    pub run: RunSettings,
    artifacts: ArtifactsEntry,
    devices: Vec<DeviceEntry>,
    tests: Vec<TestEntry>,
}

impl PlanFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        read_toml(path)
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Resolves every test's device by name.
    pub fn into_plan(self, run_id: RunId) -> anyhow::Result<RunPlan> {
        let mut devices = HashMap::with_capacity(self.devices.len());
        for device in self.devices {
            let configuration = DeviceConfiguration {
                sdk: device.sdk,
                profile: device.profile,
                emulator_image: device.emulator_image,
                sd_card_image: device.sd_card_image,
            };
            if devices.insert(device.name.clone(), configuration).is_some() {
                bail!("device {:?} is defined more than once", device.name);
            }
        }

        let tests = self
            .tests
            .into_iter()
            .map(|test| {
                let device = devices
                    .get(&test.device)
                    .ok_or_else(|| {
                        anyhow!("test {} names unknown device {:?}", test.name, test.device)
                    })?
                    .clone();
                Ok(PlannedTest {
                    test_case: TestCase::new(test.name, test.component),
                    device,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let artifact = |entry: ArtifactEntry| BuildArtifact {
            id: ArtifactId(entry.id),
            file_name: entry.file_name,
        };

        Ok(RunPlan {
            run_id,
            tests,
            artifacts: BuildArtifacts {
                app: artifact(self.artifacts.app),
                test_app: artifact(self.artifacts.test_app),
            },
        })
    }
}
