use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use devq_queue::http::HttpJobSource;
use devq_scheduler::{
    execute_run_until,
    report::{emit_all, ReportEmitter},
    run::DEFAULT_RUN_TIMEOUT,
    tracker::RetryPolicy,
    RunConfig,
};
use devq_utils::{exit::ExitCode, oneshot_notify, protocol::RunId};
use futures::StreamExt;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook_tokio::Signals;
use termcolor::StandardStream;

use crate::{
    args::ColorPreference,
    config::{PlanFile, RunSettings},
    summary::{SummaryEmitter, VerdictFileEmitter},
};

/// Retries per test case when neither the command line nor the plan says otherwise.
pub const DEFAULT_RETRY_BUDGET: u32 = 2;

pub struct RunArgs {
    pub queue_url: String,
    pub plan: PathBuf,
    pub run_id: Option<String>,
    pub retry_budget: Option<u32>,
    pub retry_failed_tests: bool,
    pub run_timeout: Option<Duration>,
    pub verdict_file: Option<PathBuf>,
    pub color: ColorPreference,
}

/// Command line overrides the plan; the plan overrides defaults.
fn run_config(args: &RunArgs, settings: &RunSettings) -> RunConfig {
    let policy = RetryPolicy {
        retry_budget: args
            .retry_budget
            .or(settings.retry_budget)
            .unwrap_or(DEFAULT_RETRY_BUDGET),
        retry_failed_tests: args.retry_failed_tests
            || settings.retry_failed_tests.unwrap_or(false),
    };
    let run_timeout = args
        .run_timeout
        .or(settings.run_timeout_secs.map(Duration::from_secs))
        .unwrap_or(DEFAULT_RUN_TIMEOUT);
    RunConfig::new(policy, run_timeout)
}

/// Submits the plan as a new run and waits for its verdict.
pub async fn start_run(args: RunArgs) -> anyhow::Result<ExitCode> {
    let plan_file = PlanFile::load(&args.plan)?;
    let config = run_config(&args, &plan_file.run);

    let run_id = args.run_id.clone().map(RunId).unwrap_or_else(RunId::unique);
    let plan = plan_file
        .into_plan(run_id.clone())
        .with_context(|| format!("invalid run plan {}", args.plan.display()))?;

    let source = Arc::new(
        HttpJobSource::new(&args.queue_url)
            .with_context(|| format!("invalid queue URL {:?}", args.queue_url))?,
    );

    let mut signals = Signals::new(TERM_SIGNALS).context("failed to install signal handlers")?;
    let signals_handle = signals.handle();
    let (cancel_tx, cancel_rx) = oneshot_notify::make_pair();
    let relay = tokio::spawn(async move {
        if let Some(signal) = signals.next().await {
            tracing::warn!(signal, "termination requested; concluding the run early");
            let _ = cancel_tx.notify();
        }
    });

    tracing::info!(
        %run_id,
        retry_budget = config.policy.retry_budget,
        run_timeout_secs = config.run_timeout.as_secs(),
        "starting run"
    );

    let result = execute_run_until(source, plan, &config, cancel_rx).await;
    signals_handle.close();
    relay.abort();
    let result = result?;

    let mut emitters: Vec<Box<dyn ReportEmitter>> = vec![Box::new(SummaryEmitter::new(
        StandardStream::stdout(args.color.into()),
    ))];
    if let Some(path) = args.verdict_file {
        emitters.push(Box::new(VerdictFileEmitter::new(path)));
    }

    let errors = emit_all(&result, &mut emitters);
    for error in &errors {
        eprintln!("devq: failed to write run report: {error}");
    }

    Ok(result.verdict.exit_code())
}
