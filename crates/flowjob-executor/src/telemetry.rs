//! Tracing subscriber setup for processes embedding the executor.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use flowjob_config::{LogFormat, LoggingConfig};

use crate::error::ExecutorError;

/// Install the global subscriber: console output plus an optional daily log file.
///
/// `RUST_LOG` overrides the configured level. Keep the returned guard alive
/// for as long as file output should be flushed.
pub fn init_tracing(config: &LoggingConfig) -> Result<Option<WorkerGuard>, ExecutorError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => filter_from_level(&config.level)?,
    };

    let (text_layer, json_layer) = match config.format {
        LogFormat::Text => (Some(fmt::layer().with_target(true)), None),
        LogFormat::Json => (None, Some(fmt::layer().json())),
    };

    let mut guard = None;
    let file_layer = match &config.directory {
        Some(directory) => {
            std::fs::create_dir_all(directory)
                .map_err(|e| ExecutorError::Telemetry(e.to_string()))?;
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix("flowjob")
                .filename_suffix("log")
                .build(directory)
                .map_err(|e| ExecutorError::Telemetry(e.to_string()))?;
            let (writer, file_guard) = tracing_appender::non_blocking(appender);
            guard = Some(file_guard);
            Some(fmt::layer().with_writer(writer).with_ansi(false))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(text_layer)
        .with(json_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| ExecutorError::Telemetry(e.to_string()))?;

    Ok(guard)
}

fn filter_from_level(level: &str) -> Result<EnvFilter, ExecutorError> {
    EnvFilter::try_new(level)
        .map_err(|e| ExecutorError::Telemetry(format!("invalid log level '{}': {}", level, e)))
}
