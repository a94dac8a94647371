//! Tracing subscriber setup.

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Environment variable holding a filter directive, e.g. `tiercache=debug`.
pub const LOG_ENV: &str = "TIERCACHE_LOG";

const LOG_FILE_PREFIX: &str = "tiercache.log";

/// Install the global subscriber.
///
/// Logs go to stderr, or to daily rolling files under `config.directory`.
/// The returned guard flushes the file writer on drop and must be held by
/// the caller for the life of the process.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
  let filter = build_filter(&config.level, std::env::var(LOG_ENV).ok())?;

  match &config.directory {
    Some(directory) => {
      std::fs::create_dir_all(directory)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;

      let appender = tracing_appender::rolling::daily(directory, LOG_FILE_PREFIX);
      let (writer, guard) = tracing_appender::non_blocking(appender);

      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

      Ok(None)
    }
  }
}

/// The environment directive wins when it parses; otherwise the configured level.
fn build_filter(level: &str, from_env: Option<String>) -> Result<EnvFilter> {
  if let Some(directive) = from_env {
    match EnvFilter::try_new(&directive) {
      Ok(filter) => return Ok(filter),
      Err(e) => eprintln!("Ignoring {}={}: {}", LOG_ENV, directive, e),
    }
  }

  EnvFilter::try_new(level).map_err(|e| eyre!("Invalid log level {}: {}", level, e))
}
