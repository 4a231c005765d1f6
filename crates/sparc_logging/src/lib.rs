//! Logging setup shared by the `sparc` binary and worker processes.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const SPARC_TARGETS: [&str; 7] = [
    "sparc",
    "sparc_db",
    "sparc_preprocess",
    "sparc_security",
    "sparc_sinks",
    "sparc_worker",
    "sparc_protocol",
];
/// A log file past this size is moved aside to `<app>.log.1` at startup.
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Logging configuration for one process.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub log_dir: &'a Path,
    /// Level applied to the sparc crates when RUST_LOG is unset
    pub level: &'a str,
    /// Mirror the file filter on stderr instead of warnings only
    pub verbose: bool,
}

/// Build the default filter directive, e.g. `sparc=info,sparc_db=info,...`.
pub fn default_filter(level: &str) -> String {
    SPARC_TARGETS
        .iter()
        .map(|target| format!("{}={}", target, level))
        .collect::<Vec<_>>()
        .join(",")
}

/// Initialize tracing with an append-only log file and stderr output.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let file = open_log_file(config.log_dir, config.app_name, MAX_LOG_FILE_SIZE)?;

    let file_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(config.level)));

    let console_filter = if config.verbose {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_filter(config.level)))
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}

/// Open `<log_dir>/<app_name>.log` for appending, keeping one previous
/// file once the current one reaches `max_size`.
fn open_log_file(log_dir: &Path, app_name: &str, max_size: u64) -> Result<File> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create logs directory: {}", log_dir.display()))?;
    let path = log_dir.join(format!("{}.log", sanitize_name(app_name)));

    let size = fs::metadata(&path).map(|meta| meta.len()).unwrap_or(0);
    if size >= max_size {
        let previous = path.with_extension("log.1");
        fs::rename(&path, &previous)
            .with_context(|| format!("Failed to move aside {}", path.display()))?;
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect()
}
