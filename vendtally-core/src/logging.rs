//! Log output for hosts running a counter
//!
//! The library only emits `tracing` events. A host that wants them on disk
//! calls [`init`], which writes daily files under the XDG state dir
//! (`~/.local/state/vendtally/vendtally.log.YYYY-MM-DD`).

use std::path::Path;

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

const LOG_FILE_PREFIX: &str = "vendtally.log";

/// Install the file subscriber
///
/// `RUST_LOG` overrides `config.level`. If a subscriber is already installed
/// (a host with its own logging), this only sets up the file writer.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard> {
    let log_dir = Config::state_dir();
    std::fs::create_dir_all(&log_dir)?;

    let (writer, guard) = tracing_appender::non_blocking(daily_appender(&log_dir, config.max_files)?);

    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let installed = tracing_subscriber::registry()
        .with(filter_for(&config.level))
        .with(file_layer)
        .try_init()
        .is_ok();

    tracing::info!(
        log_dir = %log_dir.display(),
        level = %config.level,
        installed,
        "Logging initialized"
    );

    Ok(LoggingGuard { _guard: guard })
}

fn daily_appender(dir: &Path, max_files: usize) -> Result<RollingFileAppender> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .max_log_files(max_files.max(1))
        .build(dir)
        .map_err(|e| Error::InvalidConfig(format!("failed to create log appender: {}", e)))
}

/// `RUST_LOG` if set, else the configured level; unparsable levels mean `info`
fn filter_for(level: &str) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Test subscriber writing through the test harness
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}

/// Flushes buffered log lines when dropped; hold it for the process lifetime
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daily_appender_writes_into_dir() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        assert!(daily_appender(temp_dir.path(), 0).is_ok());
    }

    #[test]
    fn test_bad_level_falls_back() {
        // Must not panic on garbage from a config file
        let _ = filter_for("[[not a directive");
        let _ = filter_for("debug");
    }

    #[test]
    fn test_init_test_is_repeatable() {
        init_test();
        init_test();
        tracing::debug!("test logging still works");
    }
}
