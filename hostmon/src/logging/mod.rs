//! Logging setup.
//!
//! Console output goes to stderr with local timezone timestamps, leaving
//! stdout to check results. When a log directory is configured, a daily
//! rotated file is written as well.

use std::path::Path;

use chrono::Local;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::LogConfig;

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "hostmon=info,plugin_api=info";

/// File name prefix of the rotated log files.
const LOG_FILE_PREFIX: &str = "hostmon.log";

/// Formats timestamps in the local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Build the filter: `RUST_LOG` wins over the configured directive, which
/// wins over [`DEFAULT_LOG_FILTER`].
pub fn build_filter(configured: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| match configured {
            Some(directive) => EnvFilter::try_new(directive),
            None => EnvFilter::try_new(DEFAULT_LOG_FILTER),
        })
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Initialize the global subscriber.
///
/// Returns the file writer guard when file logging is enabled; keep it alive
/// for the lifetime of the agent so buffered lines are flushed.
pub fn init_logging(config: &LogConfig) -> crate::Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match config.directory.as_deref() {
        Some(dir) => {
            let (writer, guard) = file_writer(dir)?;
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_timer(LocalTimer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(build_filter(config.filter.as_deref()))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_timer(LocalTimer),
        )
        .with(file_layer)
        .try_init()
        .map_err(|e| {
            crate::Error::Other(format!("Failed to set global default subscriber: {}", e))
        })?;

    Ok(guard)
}

fn file_writer(
    dir: &Path,
) -> crate::Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(dir).map_err(|e| {
        crate::Error::config(format!(
            "cannot create log directory {}: {}",
            dir.display(),
            e
        ))
    })?;
    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    Ok(tracing_appender::non_blocking(appender))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }

    #[test]
    fn test_file_writer_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        let (_writer, _guard) = file_writer(&logs).unwrap();
        assert!(logs.is_dir());
    }
}
