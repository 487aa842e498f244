mod args;
mod config;
mod logging;
mod run;
mod summary;
mod work;

use clap::Parser;
use devq_utils::exit::ExitCode;

use args::{Cli, Command};
use run::RunArgs;

async fn dispatch(command: Command) -> anyhow::Result<ExitCode> {
    match command {
        Command::Work {
            queue_url,
            config,
            worker_id,
            forever,
        } => work::start_worker(&queue_url, &config, worker_id, forever).await,
        Command::Run {
            queue_url,
            plan,
            run_id,
            retry_budget,
            retry_failed_tests,
            run_timeout,
            verdict_file,
            color,
        } => {
            run::start_run(RunArgs {
                queue_url,
                plan,
                run_id,
                retry_budget,
                retry_failed_tests,
                run_timeout,
                verdict_file,
                color,
            })
            .await
        }
    }
}

fn main() -> std::process::ExitCode {
    let Cli { log_dir, command } = Cli::parse();

    let logging_guard = logging::init(log_dir.as_deref());

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(anyhow::Error::from)
        .and_then(|runtime| runtime.block_on(dispatch(command)));

    let exit_code = match result {
        Ok(code) => code,
        Err(error) => {
            tracing::error!(error = %format!("{error:#}"), "devq failed");
            eprintln!("devq: {error:#}");
            ExitCode::DEVQ_ERROR
        }
    };

    // Flushes file logs.
    drop(logging_guard);
    exit_code.into()
}
