//! Tracing setup for the binary.

use color_eyre::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::config::{Config, LogConfig};

/// Install the global subscriber. RESCACHE_LOG overrides the configured level.
///
/// Keep the returned guard alive for the life of the program so buffered file
/// output gets flushed.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_env("RESCACHE_LOG").unwrap_or_else(|_| EnvFilter::new(&config.level));
  let stderr = fmt::layer().with_writer(std::io::stderr).with_target(true);
  let registry = Registry::default().with(filter).with(stderr);

  if !config.file {
    registry.try_init()?;
    return Ok(None);
  }

  let dir = Config::data_dir()?;
  std::fs::create_dir_all(&dir)?;
  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "rescache.log"));
  let file = fmt::layer().with_writer(writer).with_ansi(false).with_target(true);
  registry.with(file).try_init()?;
  Ok(Some(guard))
}
