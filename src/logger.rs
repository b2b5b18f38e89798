use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

pub const LOG_FILE_NAME: &str = "workerport.log";

/// `RUST_LOG` wins over `log_level` when set.
pub fn build_filter(log_level: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(log_level)
            .with_context(|| format!("invalid log level directive '{log_level}'")),
    }
}

/// Installs the global subscriber: stderr by default, or a daily rolling
/// file under `log_dir`. Keep the returned guard alive to flush the file.
pub fn init_tracing(log_level: &str, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = build_filter(log_level)?;

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log dir {}", dir.display()))?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_thread_names(true),
                )
                .try_init()
                .context("tracing subscriber already installed")?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_thread_names(true),
                )
                .try_init()
                .context("tracing subscriber already installed")?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_accepts_levels_and_directives() {
        assert!(build_filter("debug").is_ok());
        assert!(build_filter("workerport=trace,info").is_ok());
    }

    #[test]
    fn test_file_logging_writes_into_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        let guard = init_tracing("debug", Some(&logs)).unwrap();
        assert!(guard.is_some());
        tracing::info!("hello from the log test");
        drop(guard);

        let written: Vec<_> = std::fs::read_dir(&logs)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(LOG_FILE_NAME))
            .collect();
        assert_eq!(written.len(), 1);
        let text = std::fs::read_to_string(written[0].path()).unwrap();
        assert!(text.contains("hello from the log test"));

        assert!(init_tracing("debug", None).is_err());
    }
}
