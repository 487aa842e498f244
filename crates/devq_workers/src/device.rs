//! Device lifecycle: one device instance per worker, reused across jobs with the same
//! configuration, torn down when it can no longer be trusted.

use std::{fmt, path::PathBuf, time::Duration};

use async_trait::async_trait;
use devq_utils::{
    illegal_state,
    protocol::{DeviceConfiguration, DeviceKey, TestCase},
    timeout_future::{TimedOut, TimeoutFuture},
};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("failed to start device {key}: {reason}")]
    StartFailed { key: DeviceKey, reason: String },
    #[error("device {key} did not start within {after:?}")]
    StartTimedOut { key: DeviceKey, after: Duration },
    /// The device stopped responding to commands.
    #[error("device unresponsive: {0}")]
    Unresponsive(String),
    #[error("a device is already leased by this worker")]
    AlreadyLeased,
}

/// Local paths of a job's fetched build artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalArtifacts {
    pub app: PathBuf,
    pub test_app: PathBuf,
}

/// What a device reported after running a test, before classification into an outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawExecutionResult {
    Passed,
    /// The test ran and failed, e.g. an assertion or an exception in the test.
    Failed { detail: String },
    /// The process hosting the test died before producing a result.
    Crashed { detail: String },
}

/// The external device-management collaborator: boots, drives, and stops emulated devices.
#[async_trait]
pub trait DeviceDriver: Send + Sync + 'static {
    type Handle: Send + Sync + fmt::Debug + 'static;

    /// Starts a device matching `config`. May be slow; callers bound it with a timeout.
    async fn acquire(&self, config: &DeviceConfiguration) -> Result<Self::Handle, DeviceError>;

    /// Stops the device. Best-effort; failures are for the driver to log.
    async fn release(&self, handle: Self::Handle);

    /// Runs a test on the device. `timeout` is advisory for the driver; the caller enforces it
    /// regardless.
    async fn execute(
        &self,
        handle: &Self::Handle,
        test: &TestCase,
        artifacts: &LocalArtifacts,
        timeout: Duration,
    ) -> Result<RawExecutionResult, DeviceError>;
}

/// Whether a device can be trusted with the next job after being used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceHealth {
    Healthy,
    /// The device hung or stopped responding; it must be torn down, never reused.
    Corrupted,
}

/// Exclusive ownership of the worker's device for the duration of one job.
/// Must be handed back via [DeviceLifecycleManager::release].
#[derive(Debug)]
#[must_use]
pub struct DeviceLease<H> {
    key: DeviceKey,
    handle: H,
}

impl<H> DeviceLease<H> {
    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn key(&self) -> &DeviceKey {
        &self.key
    }
}

struct IdleDevice<H> {
    key: DeviceKey,
    handle: H,
}

/// Owns the single device instance of a worker.
///
/// The running instance is either idle in the manager, or leased out for a job; there is never a
/// second live instance.
pub struct DeviceLifecycleManager<D: DeviceDriver> {
    driver: D,
    idle: Option<IdleDevice<D::Handle>>,
    leased: bool,
    provision_timeout: Duration,
}

impl<D: DeviceDriver> DeviceLifecycleManager<D> {
    pub fn new(driver: D, provision_timeout: Duration) -> Self {
        Self {
            driver,
            idle: None,
            leased: false,
            provision_timeout,
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Hands out a device matching `config`, reusing the idle instance if it matches, and
    /// otherwise stopping it and starting a fresh one.
    pub async fn acquire(
        &mut self,
        config: &DeviceConfiguration,
    ) -> Result<DeviceLease<D::Handle>, DeviceError> {
        if self.leased {
            illegal_state!("acquiring a second device", key = %config.key());
            return Err(DeviceError::AlreadyLeased);
        }

        let key = config.key();

        if let Some(idle) = self.idle.take() {
            if idle.key == key {
                tracing::debug!(%key, "reusing running device");
                self.leased = true;
                return Ok(DeviceLease {
                    key,
                    handle: idle.handle,
                });
            }
            tracing::info!(from = %idle.key, to = %key, "switching device configuration");
            self.driver.release(idle.handle).await;
        }

        tracing::info!(%key, "starting device");
        let started = TimeoutFuture::new(self.driver.acquire(config), self.provision_timeout)
            .wait()
            .await;

        let handle = match started {
            Ok(Ok(handle)) => handle,
            Ok(Err(error)) => return Err(error),
            Err(TimedOut { after }) => return Err(DeviceError::StartTimedOut { key, after }),
        };

        self.leased = true;
        Ok(DeviceLease { key, handle })
    }

    /// Returns a leased device. Healthy devices stay running for the next job; corrupted ones
    /// are torn down.
    pub async fn release(&mut self, lease: DeviceLease<D::Handle>, health: DeviceHealth) {
        self.leased = false;
        let DeviceLease { key, handle } = lease;
        match health {
            DeviceHealth::Healthy => {
                devq_utils::log_assert!(
                    self.idle.is_none(),
                    %key,
                    "idle device slot already taken"
                );
                self.idle = Some(IdleDevice { key, handle });
            }
            DeviceHealth::Corrupted => {
                tracing::warn!(%key, "tearing down corrupted device");
                self.driver.release(handle).await;
            }
        }
    }

    /// Stops the idle device, if any.
    pub async fn shutdown(&mut self) {
        if let Some(IdleDevice { key, handle }) = self.idle.take() {
            tracing::info!(%key, "stopping device");
            self.driver.release(handle).await;
        }
    }
}
