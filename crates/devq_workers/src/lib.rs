//! A devq worker: pulls jobs from the queue, provisions a device and build artifacts for each,
//! runs the job's test, and reports its classified outcome.
//!
//! One worker drives one device at a time and has at most one job in flight. Concurrency comes
//! from running many workers, each polling the shared queue independently.

pub mod artifacts;
pub mod device;
pub mod process_driver;
pub mod worker;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

/// Default hard limit on a single test's execution.
pub const DEFAULT_TEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5 * 60);
/// Default limit on starting a device.
pub const DEFAULT_PROVISION_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5 * 60);
