//! Exit codes of the `devq` binary.

/// `devq` itself failed: no verdict, or a worker that could not go on.
pub const CODE_ERROR: u8 = 101;

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct ExitCode(u8);

impl ExitCode {
    /// The run's verdict was a success, or a worker stopped in an orderly way.
    pub const SUCCESS: ExitCode = ExitCode(0);
    /// The run's verdict was a failure: failed or lost tests.
    pub const FAILURE: ExitCode = ExitCode(1);
    pub const DEVQ_ERROR: ExitCode = ExitCode(CODE_ERROR);

    pub const fn get(&self) -> u8 {
        self.0
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        std::process::ExitCode::from(code.get())
    }
}
