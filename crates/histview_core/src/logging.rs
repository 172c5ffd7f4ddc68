//! Logging for the command-line front end.
//!
//! Every event the filter lets through is written to a daily log file in the
//! data directory. Stderr only shows warnings and errors, or the crate's
//! debug output when running verbose, so stdout keeps nothing but command
//! output. `HISTVIEW_LOG` (then `RUST_LOG`) overrides the file filter.

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Stderr directives when not verbose.
const QUIET_CONSOLE: &str = "warn";
/// Stderr directives with `--verbose`.
const VERBOSE_CONSOLE: &str = "warn,histview=debug,histview_core=debug";

/// Where and how loudly to log.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory holding the daily log files
    pub log_dir: PathBuf,
    /// Mirror debug output of the viewer crates to stderr
    pub verbose: bool,
}

impl LogConfig {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir, verbose: false }
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    fn console_directives(&self) -> &'static str {
        if self.verbose {
            VERBOSE_CONSOLE
        } else {
            QUIET_CONSOLE
        }
    }
}

/// Keeps the file writer alive; dropping it flushes pending entries.
pub struct LoggingGuard {
    _worker_guard: Option<WorkerGuard>,
}

/// Install the global subscriber.
///
/// A log directory that cannot be created leaves stderr as the only output.
pub fn init_logging(config: LogConfig) -> LoggingGuard {
    let (file_layer, guard) = match file_writer(&config.log_dir) {
        Ok((writer, guard)) => {
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(false)
                .with_filter(file_filter());
            (Some(layer), Some(guard))
        }
        Err(e) => {
            eprintln!("Warning: cannot log to {}: {e}", config.log_dir.display());
            (None, None)
        }
    };

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .with_target(false)
        .with_filter(EnvFilter::new(config.console_directives()));

    if let Err(e) = tracing_subscriber::registry().with(file_layer).with(console_layer).try_init() {
        eprintln!("Warning: logging was already initialized: {e}");
    }

    tracing::debug!(dir = %config.log_dir.display(), verbose = config.verbose, "Logging initialized");
    LoggingGuard { _worker_guard: guard }
}

fn file_writer(dir: &Path) -> Result<(NonBlocking, WorkerGuard), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(dir)?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("histview")
        .filename_suffix("log")
        .build(dir)?;
    Ok(tracing_appender::non_blocking(appender))
}

fn file_filter() -> EnvFilter {
    EnvFilter::try_from_env("HISTVIEW_LOG")
        .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| EnvFilter::new(default_log_filter()))
}

/// File filter used when no environment override is set.
pub fn default_log_filter() -> &'static str {
    #[cfg(debug_assertions)]
    {
        "info,histview=debug,histview_core=trace,tokio_postgres=warn"
    }
    #[cfg(not(debug_assertions))]
    {
        "warn,histview=info,histview_core=info,tokio_postgres=warn"
    }
}

/// Log directory under the default data directory.
pub fn log_dir() -> PathBuf {
    crate::services::storage::default_data_dir().join("logs")
}
