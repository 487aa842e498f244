//! A [DeviceDriver] that delegates to external commands, for hosts where device tooling is
//! scripted rather than linked.
//!
//! Every command receives the device and test under operation through environment variables:
//!
//! | variable                 | set for          |
//! |--------------------------|------------------|
//! | `DEVQ_DEVICE_SDK`        | all              |
//! | `DEVQ_DEVICE_PROFILE`    | all              |
//! | `DEVQ_EMULATOR_IMAGE`    | all              |
//! | `DEVQ_SD_CARD_IMAGE`     | all, if present  |
//! | `DEVQ_DEVICE_SERIAL`     | run-test, stop   |
//! | `DEVQ_TEST_NAME`         | run-test         |
//! | `DEVQ_TEST_COMPONENT`    | run-test         |
//! | `DEVQ_APP`               | run-test         |
//! | `DEVQ_TEST_APP`          | run-test         |
//! | `DEVQ_TEST_TIMEOUT_SECS` | run-test         |
//!
//! The start command prints the started device's serial as the last line of its stdout.
//! The run-test command exits 0 when the test passed, [UNRESPONSIVE_EXIT_CODE] when the device
//! stopped responding, and with any other code when the test failed. Exit codes listed in
//! `infrastructure-exit-codes` (by default the shell's 126 "cannot execute" and 127 "not found")
//! mean the test could not be run at all; the attempt counts as crashed, never as failed.

use std::{
    path::PathBuf,
    process::{Output, Stdio},
    time::Duration,
};

use async_trait::async_trait;
use devq_utils::protocol::{DeviceConfiguration, TestCase};
use serde_derive::Deserialize;
use tokio::process;

use crate::device::{DeviceDriver, DeviceError, LocalArtifacts, RawExecutionResult};

/// Exit code of the run-test command meaning "the device is unusable", after `EX_TEMPFAIL`.
pub const UNRESPONSIVE_EXIT_CODE: i32 = 75;

/// Shell exit codes for a command that could not be executed, or was not found.
pub const DEFAULT_INFRASTRUCTURE_EXIT_CODES: [i32; 2] = [126, 127];

fn default_infrastructure_exit_codes() -> Vec<i32> {
    DEFAULT_INFRASTRUCTURE_EXIT_CODES.to_vec()
}

/// How much of a command's output is kept in a failure detail.
const OUTPUT_TAIL_BYTES: usize = 4096;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct ProcessDriverConfig {
    pub start: CommandSpec,
    pub run_test: CommandSpec,
    #[serde(default)]
    pub stop: Option<CommandSpec>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Run-test exit codes that say nothing about the test itself.
    #[serde(default = "default_infrastructure_exit_codes")]
    pub infrastructure_exit_codes: Vec<i32>,
}

#[derive(Debug)]
pub struct ProcessDevice {
    pub serial: String,
    config: DeviceConfiguration,
}

#[derive(Debug, Clone)]
pub struct ProcessDriver {
    config: ProcessDriverConfig,
}

impl ProcessDriver {
    pub fn new(config: ProcessDriverConfig) -> Self {
        Self { config }
    }

    fn command(&self, spec: &CommandSpec, device: &DeviceConfiguration) -> process::Command {
        let mut cmd = process::Command::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        cmd.env("DEVQ_DEVICE_SDK", device.sdk.to_string());
        cmd.env("DEVQ_DEVICE_PROFILE", &device.profile);
        cmd.env("DEVQ_EMULATOR_IMAGE", &device.emulator_image);
        if let Some(sd_card) = &device.sd_card_image {
            cmd.env("DEVQ_SD_CARD_IMAGE", sd_card);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }
}

/// The last `OUTPUT_TAIL_BYTES` of a command's combined output.
fn output_tail(output: &Output) -> String {
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    let combined = combined.trim_end();

    let mut start = combined.len().saturating_sub(OUTPUT_TAIL_BYTES);
    while !combined.is_char_boundary(start) {
        start += 1;
    }
    combined[start..].to_owned()
}

#[async_trait]
impl DeviceDriver for ProcessDriver {
    type Handle = ProcessDevice;

    async fn acquire(&self, config: &DeviceConfiguration) -> Result<ProcessDevice, DeviceError> {
        let key = config.key();
        let output = self
            .command(&self.config.start, config)
            .output()
            .await
            .map_err(|e| DeviceError::StartFailed {
                key: key.clone(),
                reason: format!("failed to launch {}: {e}", self.config.start.program),
            })?;

        if !output.status.success() {
            return Err(DeviceError::StartFailed {
                key,
                reason: format!("{}: {}", output.status, output_tail(&output)),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let serial = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("device")
            .to_owned();

        tracing::debug!(%key, %serial, "device started");
        Ok(ProcessDevice {
            serial,
            config: config.clone(),
        })
    }

    async fn release(&self, handle: ProcessDevice) {
        let Some(stop) = &self.config.stop else {
            return;
        };
        let mut cmd = self.command(stop, &handle.config);
        cmd.env("DEVQ_DEVICE_SERIAL", &handle.serial);

        match cmd.output().await {
            Ok(output) if output.status.success() => {}
            Ok(output) => tracing::warn!(
                serial = %handle.serial,
                status = %output.status,
                output = %output_tail(&output),
                "stopping device failed"
            ),
            Err(error) => tracing::warn!(
                serial = %handle.serial,
                %error,
                "failed to launch device stop command"
            ),
        }
    }

    async fn execute(
        &self,
        handle: &ProcessDevice,
        test: &TestCase,
        artifacts: &LocalArtifacts,
        timeout: Duration,
    ) -> Result<RawExecutionResult, DeviceError> {
        let mut cmd = self.command(&self.config.run_test, &handle.config);
        cmd.env("DEVQ_DEVICE_SERIAL", &handle.serial)
            .env("DEVQ_TEST_NAME", &test.name)
            .env("DEVQ_TEST_COMPONENT", &test.component)
            .env("DEVQ_APP", &artifacts.app)
            .env("DEVQ_TEST_APP", &artifacts.test_app)
            .env("DEVQ_TEST_TIMEOUT_SECS", timeout.as_secs().to_string());

        // Dropping this future, e.g. on timeout, kills the test process.
        let output = match cmd.output().await {
            Ok(output) => output,
            Err(error) => {
                return Ok(RawExecutionResult::Crashed {
                    detail: format!("failed to launch {}: {error}", self.config.run_test.program),
                })
            }
        };

        let result = match output.status.code() {
            Some(0) => RawExecutionResult::Passed,
            Some(UNRESPONSIVE_EXIT_CODE) => {
                return Err(DeviceError::Unresponsive(output_tail(&output)));
            }
            Some(code) if self.config.infrastructure_exit_codes.contains(&code) => {
                RawExecutionResult::Crashed {
                    detail: format!(
                        "test command could not be run (exit {code}): {}",
                        output_tail(&output)
                    ),
                }
            }
            Some(_) => RawExecutionResult::Failed {
                detail: output_tail(&output),
            },
            // Terminated by a signal.
            None => RawExecutionResult::Crashed {
                detail: format!("{}: {}", output.status, output_tail(&output)),
            },
        };
        Ok(result)
    }
}
