//! Logging setup for CLI commands and the daemon

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "mxindex.log";

/// Get the log directory (respects env vars)
pub fn log_dir() -> PathBuf {
  mxindex::dirs::default_log_dir()
}

/// Parse log level from config string
fn parse_log_level(level: &str) -> tracing::Level {
  match level.to_lowercase().as_str() {
    "off" | "error" => tracing::Level::ERROR,
    "warn" => tracing::Level::WARN,
    "info" => tracing::Level::INFO,
    "debug" => tracing::Level::DEBUG,
    "trace" => tracing::Level::TRACE,
    _ => tracing::Level::INFO,
  }
}

/// `RUST_LOG` wins; otherwise the configured level
fn env_filter(level: &str) -> EnvFilter {
  EnvFilter::builder()
    .with_default_directive(parse_log_level(level).into())
    .from_env_lossy()
}

/// Initialize logging for one-shot commands (console only)
pub fn init_cli_logging(level: &str) {
  tracing_subscriber::fmt()
    .with_env_filter(env_filter(level))
    .with_writer(std::io::stderr)
    .init();
}

/// Initialize logging for the daemon.
///
/// In foreground mode: console only with colors
/// In background mode: daily rolling file in the log dir (no ANSI)
///
/// Returns the guard that must be kept alive for the duration of the program
pub fn init_daemon_logging(level: &str, foreground: bool) -> Option<WorkerGuard> {
  if foreground {
    tracing_subscriber::fmt()
      .with_env_filter(env_filter(level))
      .with_target(true)
      .with_ansi(true)
      .init();
    return None;
  }

  let dir = log_dir();
  if std::fs::create_dir_all(&dir).is_err() {
    // Fall back to console-only logging
    init_cli_logging(level);
    return None;
  }

  let file_appender = tracing_appender::rolling::daily(&dir, LOG_FILE);
  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

  tracing_subscriber::fmt()
    .with_env_filter(env_filter(level))
    .with_target(true)
    .with_ansi(false)
    .with_writer(file_writer)
    .init();

  Some(guard)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_log_level() {
    assert_eq!(parse_log_level("DEBUG"), tracing::Level::DEBUG);
    assert_eq!(parse_log_level("off"), tracing::Level::ERROR);
    assert_eq!(parse_log_level("nonsense"), tracing::Level::INFO);
  }
}
