//! Tracing subscriber setup.
//!
//! Everything goes to stderr so JSON printed on stdout stays machine-readable.
//! The daemon also writes a daily-rolling file under `<home>/logs/`.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "CONVOY_LOG";
pub const DAEMON_LOG_PREFIX: &str = "daemon.log";

fn filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "warn" }))
}

/// Install the stderr subscriber. Safe to call once per process.
pub fn init(verbose: bool) {
    let stderr = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);
    let _ = tracing_subscriber::registry()
        .with(filter(verbose))
        .with(stderr)
        .try_init();
}

/// Install stderr plus a daily-rolling file in `log_dir`. Keep the guard alive
/// for as long as logs should be flushed.
pub fn init_with_file(verbose: bool, log_dir: &Path) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;
    let appender = tracing_appender::rolling::daily(log_dir, DAEMON_LOG_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let stderr = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter(verbose));
    let file = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info")));

    let _ = tracing_subscriber::registry().with(stderr).with(file).try_init();
    Ok(guard)
}
