use std::fs;
use std::path::Path;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Log files of earlier runs kept next to the new one.
const KEEP_PREVIOUS_LOGS: usize = 1;

/// Failures while preparing logging.
#[derive(Debug, Error)]
pub enum LoggerError {
    /// The log directory could not be created or listed.
    #[error("log directory error: {0}")]
    Io(#[from] std::io::Error),
    /// The filter was invalid or a global subscriber is already set.
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),
}

/// Maps a configured level name onto an `EnvFilter` directive. Unknown
/// names fall back to `info`.
pub fn level_directive(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    }
}

/// Deletes all but the `keep` newest `<app_name>_*.log` files in `log_dir`.
/// Returns how many were removed.
pub fn cleanup_old_logs(log_dir: &Path, app_name: &str, keep: usize) -> Result<usize, LoggerError> {
    let prefix = format!("{app_name}_");
    let mut names: Vec<String> = fs::read_dir(log_dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with(&prefix) && name.ends_with(".log"))
        .collect();

    // The timestamp in the name sorts chronologically.
    names.sort_unstable_by(|a, b| b.cmp(a));

    let mut removed = 0;
    for name in names.iter().skip(keep) {
        match fs::remove_file(log_dir.join(name)) {
            Ok(()) => removed += 1,
            // No subscriber exists yet at this point.
            Err(e) => eprintln!("Failed to delete old log file {name}: {e}"),
        }
    }
    Ok(removed)
}

/// Installs the global subscriber: `RUST_LOG` (or `level`) filtering, a
/// console layer and a non-blocking file layer writing
/// `<log_dir>/<app_name>_<YYYY-mm-dd_HH-MM-SS>.log`, as JSON when `json`.
///
/// The returned guard flushes the file writer on drop; keep it alive for
/// the lifetime of the process.
pub fn init_tracing(app_name: &str, log_dir: &Path, level: &str, json: bool) -> Result<WorkerGuard, LoggerError> {
    fs::create_dir_all(log_dir)?;
    cleanup_old_logs(log_dir, app_name, KEEP_PREVIOUS_LOGS)?;

    let file_name = format!("{app_name}_{}.log", chrono::Local::now().format("%Y-%m-%d_%H-%M-%S"));
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, file_name));

    let file_layer = if json {
        fmt::layer().with_ansi(false).with_writer(writer).json().boxed()
    } else {
        fmt::layer().with_ansi(false).with_writer(writer).boxed()
    };
    let console_layer = fmt::layer().with_target(true);

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level_directive(level)))
        .map_err(|e| LoggerError::Subscriber(e.to_string()))?;

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .with(env_filter)
        .try_init()
        .map_err(|e| LoggerError::Subscriber(e.to_string()))?;

    tracing::info!(app = app_name, level = level_directive(level), json, "logging initialized");
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), "x").unwrap();
    }

    #[test]
    fn test_level_directive() {
        assert_eq!(level_directive("DEBUG"), "debug");
        assert_eq!(level_directive("warning"), "warn");
        assert_eq!(level_directive(" error "), "error");
        assert_eq!(level_directive("verbose"), "info");
    }

    #[test]
    fn test_cleanup_keeps_newest_and_ignores_other_files() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "server_relay_2024-01-01_10-00-00.log");
        touch(dir.path(), "server_relay_2024-01-02_10-00-00.log");
        touch(dir.path(), "server_relay_2024-01-03_10-00-00.log");
        touch(dir.path(), "other_app_2023-01-01_10-00-00.log");
        touch(dir.path(), "server_relay_notes.txt");

        let removed = cleanup_old_logs(dir.path(), "server_relay", 1).unwrap();
        assert_eq!(removed, 2);

        let mut left: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        left.sort();
        assert_eq!(
            left,
            vec![
                "other_app_2023-01-01_10-00-00.log",
                "server_relay_2024-01-03_10-00-00.log",
                "server_relay_notes.txt",
            ]
        );
    }

    #[test]
    fn test_init_creates_directory_and_log_file() {
        let dir = tempdir().unwrap();
        let log_dir = dir.path().join("nested").join("logs");

        let guard = init_tracing("relay_test", &log_dir, "debug", true).unwrap();
        tracing::info!("hello");
        drop(guard);

        let files: Vec<_> = fs::read_dir(&log_dir).unwrap().collect();
        assert_eq!(files.len(), 1);
        assert!(matches!(
            init_tracing("relay_test", &log_dir, "info", false),
            Err(LoggerError::Subscriber(_))
        ));
    }
}
