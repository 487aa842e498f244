use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variable holding the log filter directives.
pub const LOG_ENV: &str = "DEVQ_LOG";

/// Must be held until exit, so that buffered file logs are flushed.
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Installs the global subscriber: human-readable logs on stderr, and with `log_dir`, JSON logs
/// in a per-process file there too.
pub fn init(log_dir: Option<&Path>) -> LoggingGuard {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, file_guard) = match log_dir {
        Some(dir) => {
            let file_name = format!("devq-{}.log", std::process::id());
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    LoggingGuard { _file: file_guard }
}
