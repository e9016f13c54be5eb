//! tracing subscriber setup.

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
///
/// With a log file the writer is non-blocking; keep the returned guard alive
/// until exit or buffered lines are lost.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
  let env_filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(&config.level))
    .map_err(|e| eyre!("Invalid log level {:?}: {}", config.level, e))?;

  let (layer, guard) = match &config.file {
    Some(path) => {
      let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
      let file_name = path
        .file_name()
        .ok_or_else(|| eyre!("Log file path has no file name: {}", path.display()))?;
      std::fs::create_dir_all(directory)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;

      let appender = tracing_appender::rolling::never(directory, file_name);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = fmt::layer().with_writer(writer).with_ansi(false).with_target(true).boxed();
      (layer, Some(guard))
    }
    None => (
      fmt::layer().with_writer(std::io::stderr).with_target(true).boxed(),
      None,
    ),
  };

  tracing_subscriber::registry()
    .with(env_filter)
    .with(layer)
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}
