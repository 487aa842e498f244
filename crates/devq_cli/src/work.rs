use std::{path::Path, sync::Arc, time::Duration};

use anyhow::Context;
use devq_queue::http::HttpJobSource;
use devq_utils::{exit::ExitCode, oneshot_notify, protocol::WorkerId};
use devq_workers::{
    artifacts::{ArtifactFetcher, HttpArtifactSource},
    process_driver::ProcessDriver,
    worker::{Worker, WorkerConfig, WorkerExit, WorkerExitStatus},
};
use futures::StreamExt;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook_tokio::Signals;

use crate::config::{WorkerFile, WorkerSettings};

/// Limit on downloading a single artifact.
const ARTIFACT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(10 * 60);

fn worker_config(worker_id: WorkerId, settings: &WorkerSettings, forever: bool) -> WorkerConfig {
    let idle_grace_period = (!forever).then(|| Duration::from_secs(settings.idle_grace_secs));
    WorkerConfig {
        test_timeout: Duration::from_secs(settings.test_timeout_secs),
        provision_timeout: Duration::from_secs(settings.provision_timeout_secs),
        idle_grace_period,
        report_attempts: settings.report_attempts,
        max_consecutive_device_failures: settings.max_consecutive_device_failures,
        ..WorkerConfig::new(worker_id)
    }
}

fn exit_code(exit: &WorkerExit) -> ExitCode {
    match &exit.status {
        WorkerExitStatus::Exhausted | WorkerExitStatus::ShutdownRequested => ExitCode::SUCCESS,
        WorkerExitStatus::DeviceFailure(reason) => {
            eprintln!("devq: worker stopped, devices could not be provisioned: {reason}");
            ExitCode::DEVQ_ERROR
        }
    }
}

/// Runs one worker until the queue runs dry, its devices fail, or a termination signal arrives.
pub async fn start_worker(
    queue_url: &str,
    config_path: &Path,
    worker_id: Option<String>,
    forever: bool,
) -> anyhow::Result<ExitCode> {
    let file = WorkerFile::load(config_path)?;

    let worker_id = worker_id.map(WorkerId).unwrap_or_else(WorkerId::unique);
    let config = worker_config(worker_id.clone(), &file.worker, forever);

    let source = Arc::new(
        HttpJobSource::new(queue_url)
            .with_context(|| format!("invalid queue URL {queue_url:?}"))?,
    );
    let artifact_url = file.artifacts.url.as_deref().unwrap_or(queue_url);
    let artifact_source = HttpArtifactSource::new(artifact_url, ARTIFACT_DOWNLOAD_TIMEOUT)
        .with_context(|| format!("invalid artifact store URL {artifact_url:?}"))?;
    let fetcher = ArtifactFetcher::new(Arc::new(artifact_source), &file.artifacts.cache_dir);
    let driver = ProcessDriver::new(file.driver);

    let worker = Worker::new(config, source, driver, fetcher);

    let mut signals = Signals::new(TERM_SIGNALS).context("failed to install signal handlers")?;
    let signals_handle = signals.handle();
    let (shutdown_tx, shutdown_rx) = oneshot_notify::make_pair();
    let relay = tokio::spawn(async move {
        if let Some(signal) = signals.next().await {
            tracing::info!(signal, "termination requested; finishing the current job");
            let _ = shutdown_tx.notify();
        }
    });

    tracing::info!(%worker_id, queue_url, "worker starting");
    let exit = worker.run(shutdown_rx).await;
    tracing::info!(
        %worker_id,
        status = ?exit.status,
        jobs_handled = exit.jobs_handled,
        reports_dropped = exit.reports_dropped,
        "worker exited"
    );

    signals_handle.close();
    relay.abort();

    Ok(exit_code(&exit))
}
