use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::error::{ListenerError, Result};

const MAX_LOG_FILES: usize = 14;
const LOG_FILE_PREFIX: &str = "webhook";
const DEFAULT_LOG_FILTER: &str = "info";

/// Daily rolling log files, the audit trail kept next to console output.
/// At most `MAX_LOG_FILES` files are kept.
pub struct FileLogger {
    log_directory: PathBuf,
}

impl FileLogger {
    pub fn new(log_directory: impl Into<PathBuf>) -> Self {
        Self {
            log_directory: log_directory.into(),
        }
    }

    /// Creates the directory and a non-blocking writer into it. The guard
    /// must live as long as logging should reach the file.
    pub fn setup_file_logging(&self) -> Result<(NonBlocking, WorkerGuard)> {
        std::fs::create_dir_all(&self.log_directory)?;

        let file_appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(LOG_FILE_PREFIX)
            .filename_suffix("log")
            .max_log_files(MAX_LOG_FILES)
            .build(&self.log_directory)
            .map_err(|e| {
                ListenerError::Config(format!(
                    "Failed to create log file in '{}': {}",
                    self.log_directory.display(),
                    e
                ))
            })?;

        Ok(tracing_appender::non_blocking(file_appender))
    }
}

/// Installs the global subscriber: console output always, a rolling file
/// when `log_dir` is set. Filter comes from `RUST_LOG`, default `info`.
pub fn setup_logging(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    match log_dir {
        Some(dir) => {
            let (file_writer, guard) = FileLogger::new(dir).setup_file_logging()?;
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer()) // Console output
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(file_writer)
                        .with_ansi(false),
                )
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            Ok(None)
        }
    }
}
