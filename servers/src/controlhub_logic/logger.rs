use std::fs;
use std::path::Path;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const LOG_FILE_PREFIX: &str = "server_controlhub";

/// # Setup Logging
///
/// Console output for humans plus a daily rotating JSON file for machines.
/// `RUST_LOG` wins over `log_level` when set.
///
/// The returned guard flushes the file writer on drop; keep it alive in `main`.
pub fn setup_logging(log_dir: &Path, log_level: &str) -> Result<WorkerGuard> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }

    let file_appender = rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking_appender, guard) = non_blocking(file_appender);

    let console_layer = fmt::layer().with_target(true).with_ansi(true);

    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking_appender)
        .json();

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!(level = %log_level, dir = %log_dir.display(), "Logging initialized");
    Ok(guard)
}
