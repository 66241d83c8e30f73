//! Structured logging and diagnostics for ssh-tunnel.
//!
//! The daemon logs tunnel transitions and the client count through `tracing`.
//! In the foreground logs go to stderr; a detached daemon has no terminal, so
//! it only writes to the configured log file.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// File name used when the log path has none
const DEFAULT_LOG_FILE_NAME: &str = "ssh-tunnel.log";

/// Log verbosity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Only errors
    Quiet,
    /// Normal logging (info level)
    #[default]
    Normal,
    /// Verbose logging (debug level)
    Verbose,
    /// Very verbose logging (trace level)
    Trace,
}

impl Verbosity {
    /// Map a repeated `-v` count onto a level.
    pub fn from_count(count: u8) -> Self {
        match count {
            0 => Verbosity::Normal,
            1 => Verbosity::Verbose,
            _ => Verbosity::Trace,
        }
    }

    /// Get the tracing level filter for this verbosity.
    pub fn as_level_filter(&self) -> LevelFilter {
        match self {
            Verbosity::Quiet => LevelFilter::ERROR,
            Verbosity::Normal => LevelFilter::INFO,
            Verbosity::Verbose => LevelFilter::DEBUG,
            Verbosity::Trace => LevelFilter::TRACE,
        }
    }
}

/// Configuration for the logging system.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Verbosity level for both outputs.
    pub verbosity: Verbosity,
    /// Optional path to log file.
    pub log_file: Option<String>,
    /// Also write to stderr.
    pub stderr: bool,
}

impl LogConfig {
    /// Logging for a daemon with a terminal attached
    pub fn foreground(verbosity: Verbosity, log_file: Option<String>) -> Self {
        Self {
            verbosity,
            log_file,
            stderr: true,
        }
    }

    /// Logging for a detached daemon; file only
    pub fn detached(verbosity: Verbosity, log_file: Option<String>) -> Self {
        Self {
            verbosity,
            log_file,
            stderr: false,
        }
    }
}

/// Guard that must be kept alive for the duration of logging.
///
/// When this guard is dropped, the logging system will flush pending logs.
pub struct LogGuard {
    file_guard: Option<WorkerGuard>,
}

impl LogGuard {
    fn new(file_guard: Option<WorkerGuard>) -> Self {
        Self { file_guard }
    }

    /// Whether a file writer is attached
    pub fn has_file(&self) -> bool {
        self.file_guard.is_some()
    }
}

/// Split a log path into the directory and file name for the appender.
fn split_log_path(log_file: &str) -> (&Path, &str) {
    let path = Path::new(log_file);
    let parent_dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let filename = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(DEFAULT_LOG_FILE_NAME);
    (parent_dir, filename)
}

/// Initialize the logging system.
///
/// Returns a guard that must be kept alive for the duration of logging.
/// When the guard is dropped, pending log entries will be flushed.
///
/// # Example
///
/// ```ignore
/// use ssh_tunnel::logging::{init_logging, LogConfig, Verbosity};
///
/// let config = LogConfig::foreground(Verbosity::Verbose, Some("/tmp/ssh-tunnel.log".to_string()));
/// let _guard = init_logging(&config);
/// tracing::info!("Logging initialized");
/// ```
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter = EnvFilter::builder()
        .with_default_directive(config.verbosity.as_level_filter().into())
        .from_env_lossy();

    // The appender opens in append mode, so restarts keep earlier history
    let (file_layer, file_guard) = if let Some(ref log_file_path) = config.log_file {
        let (parent_dir, filename) = split_log_path(log_file_path);

        let file_appender = tracing_appender::rolling::never(parent_dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_writer(non_blocking)
            .with_filter(config.verbosity.as_level_filter());

        (Some(file_layer), Some(guard))
    } else {
        (None, None)
    };

    let stderr_layer = if config.stderr {
        Some(
            fmt::layer()
                .with_ansi(true)
                .with_target(false)
                .with_writer(std::io::stderr)
                .with_filter(config.verbosity.as_level_filter()),
        )
    } else {
        None
    };

    // A second init (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    LogGuard::new(file_guard)
}
