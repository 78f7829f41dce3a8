//! Log setup.
//!
//! The terminal belongs to the front end, so logs go to a daily-rolling
//! file. `RUST_LOG` controls levels (default `info`).

use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "clinic-sync.log";

/// Default log directory: `$XDG_DATA_HOME/clinic-sync/logs`.
pub fn default_log_dir() -> Option<PathBuf> {
  dirs::data_dir().map(|d| d.join("clinic-sync").join("logs"))
}

/// Install the global subscriber.
///
/// Keep the returned guard alive for the whole run; dropping it flushes
/// and stops the background writer.
pub fn init(log_dir: Option<&Path>) -> Result<WorkerGuard> {
  let dir = match log_dir {
    Some(dir) => dir.to_path_buf(),
    None => default_log_dir().ok_or_else(|| eyre!("Could not determine a log directory"))?,
  };
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  tracing_subscriber::registry()
    .with(env_filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false).with_target(false))
    .try_init()
    .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

  tracing::info!(dir = %dir.display(), "logging initialised");
  Ok(guard)
}
