//! Log output: compact stdout, plus a plain-text file when configured.

use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Map the gateway's level names onto a filter directive. Unknown names mean
/// errors only.
pub fn level_directive(level: &str) -> &'static str {
    match level.trim().to_ascii_uppercase().as_str() {
        "DEBUG" => "debug",
        "INFO" => "info",
        "WARN" | "WARNING" => "warn",
        _ => "error",
    }
}

/// Install the global subscriber. `RUST_LOG`, when set, wins over `level`.
///
/// The returned guard flushes the file writer on drop and must be held for the
/// life of the process.
pub fn init(level: &str, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(level)));

    let (file_layer, guard) = match log_file.and_then(open_log_file) {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).compact())
        .with(file_layer)
        .try_init()
        .context("install tracing subscriber")?;
    Ok(guard)
}

// A log file that cannot be opened degrades to stdout only.
fn open_log_file(path: &Path) -> Option<RollingFileAppender> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = path.file_name()?.to_string_lossy().into_owned();
    let _ = std::fs::create_dir_all(dir);
    match RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(name)
        .build(dir)
    {
        Ok(appender) => Some(appender),
        Err(e) => {
            eprintln!("log file {} unavailable, logging to stdout only: {e}", path.display());
            None
        }
    }
}
