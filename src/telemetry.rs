use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides the configured level. When a log file is configured
/// the returned guard must be kept alive until exit so buffered lines are
/// flushed.
pub fn init(logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
  let env_filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(&logging.level))
    .map_err(|e| eyre!("Invalid log level {:?}: {}", logging.level, e))?;

  match &logging.file {
    Some(path) => {
      let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| eyre!("Failed to open log file {}: {}", path.display(), e))?;
      let (writer, guard) = tracing_appender::non_blocking(file);

      tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .try_init()
        .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;
      Ok(None)
    }
  }
}
