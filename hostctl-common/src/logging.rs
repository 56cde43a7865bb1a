//! Process-wide tracing setup.
//!
//! Human-readable output goes to stderr. When a log directory is configured
//! a JSON copy of every event at `debug` and above is written there too,
//! rotated daily.

use std::path::PathBuf;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};

const LOG_FILE_PREFIX: &str = "hostctl.log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Filter directive for stderr, e.g. `info` or `hostctl_common=debug`.
    /// `RUST_LOG` wins when set.
    pub level: String,
    pub json_stderr: bool,
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_stderr: false,
            log_dir: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter '{directive}': {reason}")]
    Filter { directive: String, reason: String },

    #[error("cannot create log directory {path}: {source}")]
    LogDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialised,
}

impl crate::errors::Cataloged for LoggingError {
    fn error_code(&self) -> crate::errors::ErrorCode {
        crate::errors::ErrorCode::InternalLoggingError
    }
}

fn stderr_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level).map_err(|e| LoggingError::Filter {
        directive: config.level.clone(),
        reason: e.to_string(),
    })
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop; hold it for the
/// life of the process.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>, LoggingError> {
    let filter = stderr_filter(config)?;

    let stderr_layer = if config.json_stderr {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed()
    };

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|source| LoggingError::LogDir {
                path: dir.clone(),
                source,
            })?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_target(true)
                .with_writer(writer)
                .with_filter(EnvFilter::new("debug"))
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialised)?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_filter_directive_is_reported() {
        let config = LoggingConfig {
            level: "hostctl=loud".to_string(),
            ..LoggingConfig::default()
        };
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let err = stderr_filter(&config).unwrap_err();
        assert!(err.to_string().contains("hostctl=loud"));
    }

    #[test]
    fn test_default_level_is_info() {
        assert_eq!(LoggingConfig::default().level, "info");
        assert!(LoggingConfig::default().log_dir.is_none());
    }
}
