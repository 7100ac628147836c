//! Core logging bootstrap.
//!
//! # Responsibility
//! - Start the `flexi_logger` backend once per process from [`LoggingConfig`].
//! - Keep every core log line in `event=<name> module=<module> status=<status>`
//!   key/value form so diagnostics can be grepped.
//!
//! # Invariants
//! - Initialization is idempotent for an identical (normalized) config.
//! - Re-initialization with a different config is rejected, never applied.
//! - Initialization never panics.

use crate::config::LoggingConfig;
use flexi_logger::{Cleanup, Criterion, FileSpec, Logger, LoggerHandle, Naming, WriteMode};
use log::info;
use once_cell::sync::OnceCell;
use std::path::PathBuf;
use thiserror::Error;

const LOG_FILE_BASENAME: &str = "collections";

static ACTIVE_LOGGER: OnceCell<ActiveLogger> = OnceCell::new();

struct ActiveLogger {
    config: LoggingConfig,
    _handle: LoggerHandle,
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("unsupported log level `{0}`; expected trace|debug|info|warn|error")]
    UnsupportedLevel(String),
    #[error("log_dir must be an absolute path, got `{0}`")]
    RelativeLogDir(PathBuf),
    #[error("failed to create log directory `{path}`: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to start logger: {0}")]
    Backend(#[from] flexi_logger::FlexiLoggerError),
    #[error("logging already initialized as {active}; refusing to switch to {requested}")]
    Conflict { active: String, requested: String },
}

/// Initializes core logging.
///
/// With `log_dir` set, logs go to size-rotated files named `collections*.log`
/// in that directory; otherwise they go to stderr.
///
/// # Errors
/// - Unsupported level or relative `log_dir`.
/// - Log directory cannot be created, or the backend fails to start.
/// - Logging is already active with a different configuration.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let requested = normalize_config(config)?;
    let active = ACTIVE_LOGGER.get_or_try_init(|| start_logger(&requested))?;

    if active.config != requested {
        return Err(LoggingError::Conflict {
            active: describe(&active.config),
            requested: describe(&requested),
        });
    }

    Ok(())
}

/// Returns the active (normalized) logging config, if any.
pub fn logging_status() -> Option<LoggingConfig> {
    ACTIVE_LOGGER.get().map(|active| active.config.clone())
}

fn start_logger(config: &LoggingConfig) -> Result<ActiveLogger, LoggingError> {
    let logger = Logger::try_with_str(&config.level)?;

    let logger = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|source| LoggingError::CreateDir {
                path: dir.clone(),
                source,
            })?;
            logger
                .log_to_file(
                    FileSpec::default()
                        .directory(dir.as_path())
                        .basename(LOG_FILE_BASENAME),
                )
                .rotate(
                    Criterion::Size(config.max_file_size_bytes),
                    Naming::Numbers,
                    Cleanup::KeepLogFiles(config.max_files),
                )
                .write_mode(WriteMode::BufferAndFlush)
                .append()
                .format_for_files(flexi_logger::detailed_format)
        }
        None => logger
            .log_to_stderr()
            .format(flexi_logger::detailed_format),
    };

    let handle = logger.start()?;
    info!(
        "event=core_init module=logging status=ok version={} {}",
        env!("CARGO_PKG_VERSION"),
        describe(config)
    );

    Ok(ActiveLogger {
        config: config.clone(),
        _handle: handle,
    })
}

fn normalize_config(config: &LoggingConfig) -> Result<LoggingConfig, LoggingError> {
    let level = normalize_level(&config.level)?;
    let log_dir = match &config.log_dir {
        Some(dir) if !dir.is_absolute() => {
            return Err(LoggingError::RelativeLogDir(dir.clone()));
        }
        other => other.clone(),
    };

    Ok(LoggingConfig {
        level: level.to_string(),
        log_dir,
        ..config.clone()
    })
}

fn normalize_level(level: &str) -> Result<&'static str, LoggingError> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok("trace"),
        "debug" => Ok("debug"),
        "info" => Ok("info"),
        "warn" | "warning" => Ok("warn"),
        "error" => Ok("error"),
        other => Err(LoggingError::UnsupportedLevel(other.to_string())),
    }
}

fn describe(config: &LoggingConfig) -> String {
    match &config.log_dir {
        Some(dir) => format!("level={} log_dir={}", config.level, dir.display()),
        None => format!("level={} log_dir=stderr", config.level),
    }
}
