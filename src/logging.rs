//! Tracing subscriber setup

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::{LogConfig, log_path};

/// Install the global subscriber
///
/// `RUST_LOG` takes precedence over the configured level. Console output goes
/// to stderr so stdout stays free for reports. When file logging is enabled
/// the returned guard must be held until exit to flush buffered lines.
pub fn init(config: &LogConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console = fmt::layer().with_writer(std::io::stderr).with_target(true);
    let console = if config.json {
        console.json().boxed()
    } else {
        console.boxed()
    };

    let (file_layer, guard) = if config.file {
        let path = log_path();
        let dir = path
            .parent()
            .context("log path has no parent directory")?;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
        let file_name = path
            .file_name()
            .context("log path has no file name")?;

        let appender = tracing_appender::rolling::never(dir, file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer().with_ansi(false).with_writer(writer);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .context("Failed to init tracing")?;

    Ok(guard)
}
