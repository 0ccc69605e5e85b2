//! Structured logging.
//!
//! [`init_logging`] installs the global subscriber once: warnings to stderr
//! and every record as a flattened JSON line to a file sink. The file sink is
//! attached later with [`init_file_logging`] once the data directory is
//! known; until then file output is dropped.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, Once};

use file_rotate::compression::Compression;
use file_rotate::suffix::AppendCount;
use file_rotate::{ContentLimit, FileRotate};
use once_cell::sync::Lazy;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::security::fs_policy::ensure_directory_exists;
use crate::AppResult;

pub const ENV_LOG_FILTER: &str = "CESPITI_LOG";
pub const ENV_LOG_MAX_SIZE_BYTES: &str = "CESPITI_LOG_MAX_SIZE_BYTES";
pub const ENV_LOG_MAX_FILES: &str = "CESPITI_LOG_MAX_FILES";

pub const LOG_FILE_NAME: &str = "application.log";
pub const DEFAULT_LOG_FILTER: &str = "cespiti=info";
pub const DEFAULT_LOG_MAX_SIZE_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_LOG_MAX_FILES: usize = 5;

static INIT: Once = Once::new();
static FILE_SINK: Lazy<Mutex<Option<(NonBlocking, WorkerGuard)>>> = Lazy::new(|| Mutex::new(None));

/// Writes into the currently attached file sink, or nowhere.
struct FileSinkWriter;

impl Write for FileSinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut slot = FILE_SINK.lock().unwrap_or_else(|e| e.into_inner());
        match slot.as_mut() {
            Some((writer, _)) => writer.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut slot = FILE_SINK.lock().unwrap_or_else(|e| e.into_inner());
        match slot.as_mut() {
            Some((writer, _)) => writer.flush(),
            None => Ok(()),
        }
    }
}

/// Install the global subscriber. Safe to call more than once; only the
/// first call has an effect.
pub fn init_logging() {
    INIT.call_once(|| {
        let _ = tracing_log::LogTracer::init();

        let filter = std::env::var(ENV_LOG_FILTER)
            .ok()
            .and_then(|value| EnvFilter::try_new(value).ok())
            .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER));

        let file_layer = fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .with_target(true)
            .with_timer(UtcTime::rfc_3339())
            .with_writer(|| FileSinkWriter);

        let stderr_layer = fmt::layer()
            .compact()
            .with_ansi(false)
            .with_target(false)
            .with_writer(io::stderr)
            .with_filter(LevelFilter::WARN);

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(stderr_layer)
            .try_init();
    });
}

fn env_limit(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

/// Attach the rotating file sink at `<data_dir>/application.log` and return
/// its path. Replaces any previously attached sink.
pub fn init_file_logging(data_dir: &Path) -> AppResult<PathBuf> {
    ensure_directory_exists(data_dir)?;
    let path = data_dir.join(LOG_FILE_NAME);

    let max_bytes = env_limit(ENV_LOG_MAX_SIZE_BYTES, DEFAULT_LOG_MAX_SIZE_BYTES);
    let max_files = env_limit(ENV_LOG_MAX_FILES, DEFAULT_LOG_MAX_FILES);

    let rotating = FileRotate::new(
        &path,
        AppendCount::new(max_files),
        ContentLimit::BytesSurpassed(max_bytes),
        Compression::None,
        #[cfg(unix)]
        None,
    );
    let (writer, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .lossy(false)
        .finish(rotating);

    let previous = FILE_SINK
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .replace((writer, guard));
    drop(previous);

    tracing::info!(
        target: "cespiti",
        event = "file_logging_started",
        path = %path.display(),
        max_bytes,
        max_files,
        version = env!("CARGO_PKG_VERSION"),
        commit = option_env!("CESPITI_GIT_HASH").unwrap_or("unknown")
    );
    Ok(path)
}

/// Detach the file sink, blocking until buffered lines reach the file.
pub fn flush_file_logs() {
    let sink = FILE_SINK.lock().unwrap_or_else(|e| e.into_inner()).take();
    drop(sink);
}
