//! Tracing subscriber setup.

use std::io;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use crate::config::LogConfig;

/// Env var holding an `EnvFilter` directive.
pub const LOG_ENV: &str = "AP_LOG";

const DEFAULT_FILTER: &str = "warn";

/// Installs the global subscriber.
///
/// Logs go to a daily-rolling file under `config.dir` when set, otherwise to
/// stderr. The returned guard must be held for the lifetime of the process so
/// buffered file output is flushed. Calling this twice is a no-op.
pub fn init(config: &LogConfig) -> Option<WorkerGuard> {
    let filter = || {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| {
            EnvFilter::new(config.filter.as_deref().unwrap_or(DEFAULT_FILTER))
        })
    };

    if let Some(dir) = config.dir.as_deref().filter(|d| !d.trim().is_empty()) {
        let appender = tracing_appender::rolling::daily(Path::new(dir), "ap.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true)
            .with_filter(filter());
        let _ = tracing_subscriber::registry().with(layer).try_init();
        return Some(guard);
    }

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_filter(filter());
    let _ = tracing_subscriber::registry().with(layer).try_init();
    None
}

/// Masks a secret for log output, keeping a short prefix.
pub fn mask_token(token: &str) -> String {
    let prefix: String = token.chars().take(6).collect();
    if token.chars().count() <= 6 {
        "***".to_string()
    } else {
        format!("{prefix}***")
    }
}
