//! Builders shared by devq's tests.

use devq_utils::protocol::{
    ArtifactId, BuildArtifact, BuildArtifacts, DeviceConfiguration, Job, RunId, TestCase,
};

pub const TEST_COMPONENT: &str = "app";

/// A test case named `name` in the default test component.
pub fn tc(name: &str) -> TestCase {
    TestCase::new(name, TEST_COMPONENT)
}

pub fn device() -> DeviceConfiguration {
    device_with(30, "phone")
}

pub fn device_with(sdk: u32, profile: &str) -> DeviceConfiguration {
    DeviceConfiguration {
        sdk,
        profile: profile.to_owned(),
        emulator_image: format!("emulator-{sdk}-{profile}"),
        sd_card_image: None,
    }
}

pub fn artifacts() -> BuildArtifacts {
    BuildArtifacts {
        app: BuildArtifact {
            id: ArtifactId("app-0123".to_owned()),
            file_name: "app.apk".to_owned(),
        },
        test_app: BuildArtifact {
            id: ArtifactId("test-app-4567".to_owned()),
            file_name: "app-androidTest.apk".to_owned(),
        },
    }
}

/// A first-attempt job for `test_case` on the default device.
pub fn job(run_id: &RunId, test_case: TestCase) -> Job {
    Job::new(run_id.clone(), test_case, device(), artifacts())
}

/// Temporary directory for artifact caches and the like.
pub fn scratch_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("failed to create temporary directory")
}
