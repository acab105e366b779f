//! Tracing subscriber setup.
//!
//! Console output always; a daily rolling file as well when the config names
//! a log directory. `RUST_LOG` overrides the configured filter.

use crate::config::LoggingConfig;
use crate::error::{Result, StageflowError};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log file name prefix inside `log_dir`
pub const LOG_FILE_PREFIX: &str = "stageflow.log";

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop; keep it alive for
/// the life of the process.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .map_err(|e| {
            StageflowError::Config(format!("Invalid log filter '{}': {}", config.filter, e))
        })?;

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_thread_names(true)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .with(file_layer)
        .try_init()
        .map_err(|e| StageflowError::Config(format!("Logging already initialized: {}", e)))?;

    Ok(guard)
}
