use std::{path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};

fn parse_secs(s: &str) -> Result<Duration, String> {
    s.parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| format!("expected a whole number of seconds, got {s:?}"))
}

/// Device queue
///
/// Distributes device tests across a pool of workers, one device per worker, and tracks every
/// test of a run to a single verdict.
#[derive(Parser)]
#[clap(version)]
pub struct Cli {
    /// Directory to additionally write JSON logs to.
    /// Log verbosity is controlled through `DEVQ_LOG`, e.g. `DEVQ_LOG=devq_workers=debug`.
    #[clap(long, global = true, env = "DEVQ_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Starts one worker, bound to one device, pulling jobs until the queue runs dry.
    Work {
        /// Base URL of the queue service.
        #[clap(long, env = "DEVQ_QUEUE_URL")]
        queue_url: String,

        /// Worker configuration file, including the device driver commands.
        #[clap(long, short)]
        config: PathBuf,

        /// Identity of this worker at the queue. Generated when absent.
        #[clap(long)]
        worker_id: Option<String>,

        /// Keep polling an empty queue forever, rather than exiting after the idle grace period.
        #[clap(long)]
        forever: bool,
    },
    /// Submits a run, follows it to a verdict, and exits with the verdict.
    ///
    /// Exits 0 if every test passed, 1 if any test failed or was lost, and 101 if no verdict
    /// could be reached.
    Run {
        /// Base URL of the queue service.
        #[clap(long, env = "DEVQ_QUEUE_URL")]
        queue_url: String,

        /// Run plan: the tests, their devices, and the build artifacts.
        #[clap(long, short)]
        plan: PathBuf,

        /// Identity of the run. Generated when absent.
        #[clap(long)]
        run_id: Option<String>,

        /// Retries allowed per test, beyond the first attempt. Overrides the plan.
        #[clap(long)]
        retry_budget: Option<u32>,

        /// Retry definitive test failures, not only infrastructure errors. Overrides the plan.
        #[clap(long)]
        retry_failed_tests: bool,

        /// Seconds after which every unresolved test is considered lost. Overrides the plan.
        #[clap(long, value_parser = parse_secs)]
        run_timeout: Option<Duration>,

        /// Where to write the run result as JSON.
        #[clap(long)]
        verdict_file: Option<PathBuf>,

        /// Whether to color the summary.
        #[clap(long, value_enum, default_value_t = ColorPreference::Auto)]
        color: ColorPreference,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColorPreference {
    Auto,
    Always,
    Never,
}

impl From<ColorPreference> for termcolor::ColorChoice {
    fn from(preference: ColorPreference) -> Self {
        match preference {
            ColorPreference::Auto => termcolor::ColorChoice::Auto,
            ColorPreference::Always => termcolor::ColorChoice::Always,
            ColorPreference::Never => termcolor::ColorChoice::Never,
        }
    }
}
