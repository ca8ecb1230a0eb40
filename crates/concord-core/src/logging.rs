//! Tracing setup.
//!
//! Logs go to a daily-rolling file under `${CONCORD_HOME}/logs` so they never
//! interleave with the interactive output on stdout.

use std::fs;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, paths};

/// Environment variable that overrides the configured log filter.
pub const LOG_ENV: &str = "CONCORD_LOG";

/// Builds the log filter: `CONCORD_LOG` wins over the config value.
pub fn build_filter(config: &Config) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber.
///
/// The returned guard flushes buffered log lines when dropped; keep it alive
/// for the lifetime of the process.
pub fn init(config: &Config) -> Result<WorkerGuard> {
    let dir = paths::logs_dir();
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

    let appender = tracing_appender::rolling::daily(&dir, "concord.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_env_filter(build_filter(config))
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {e}"))?;

    Ok(guard)
}
