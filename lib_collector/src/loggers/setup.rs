//! # Logging Setup
//!
//! Installs the global `tracing` subscriber: an `EnvFilter` (from `RUST_LOG`,
//! falling back to the configured level), a human-readable console layer and a
//! JSON layer written to a daily rolling file through a non-blocking writer.

use std::io;
use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Where and how much to log.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Directory for the rolling files; created if missing.
    pub log_dir: PathBuf,
    /// File name prefix, usually the binary name.
    pub file_prefix: String,
    /// Level directive used when `RUST_LOG` is unset.
    pub level: String,
}

impl LogOptions {
    /// Options for `binary`, logging at `level` into `log_dir`.
    pub fn new(log_dir: impl Into<PathBuf>, binary: &str, level: &str) -> Self {
        Self { log_dir: log_dir.into(), file_prefix: binary.to_string(), level: level.to_string() }
    }
}

/// # Setup Logging
///
/// Returns the file writer's [`WorkerGuard`]; buffered lines are flushed when
/// it is dropped, so the caller keeps it alive for the life of the process.
pub fn setup_logging(options: &LogOptions) -> io::Result<WorkerGuard> {
    std::fs::create_dir_all(&options.log_dir)?;

    let file_appender = rolling::daily(&options.log_dir, &options.file_prefix);
    let (non_blocking_appender, guard) = non_blocking(file_appender);

    let console_layer = fmt::layer().with_target(true).with_ansi(true);
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking_appender)
        .json();

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&options.level))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::AlreadyExists, e.to_string()))?;

    Ok(guard)
}
