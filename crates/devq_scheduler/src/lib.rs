//! Client side of a devq run: submits a run's jobs, follows their outcomes, retries what may be
//! retried, and concludes with one [result::RunResult].

pub mod report;
pub mod result;
pub mod run;
pub mod tracker;

pub use run::{execute_run, execute_run_until, RunConfig, RunError};
