use std::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

/// Initializes the logging system with both console and file output.
///
/// The returned guard flushes the file writer when dropped; hold it for the
/// lifetime of the process.
pub fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("lakehouse=info"));

    // Console only if the log directory cannot be created
    if fs::create_dir_all(&config.dir).is_err() {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stdout))
            .try_init();
        return None;
    }

    // Daily-rotated JSON file next to human-readable console output
    let file_appender = tracing_appender::rolling::daily(&config.dir, &config.file_prefix);
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer().json().with_writer(non_blocking_writer);
    let console_layer = fmt::layer().with_writer(std::io::stdout);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init();

    Some(guard)
}
