use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const DEFAULT_ENDPOINT: &str = "http://localhost:8978/api/gql";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub server: ServerConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  /// GraphQL endpoint, e.g. http://localhost:8978/api/gql
  pub url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      url: DEFAULT_ENDPOINT.to_string(),
      timeout_secs: default_timeout_secs(),
    }
  }
}

fn default_timeout_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Unused entries older than this are purged
  #[serde(default = "default_ttl_secs")]
  pub ttl_secs: u64,
  #[serde(default = "default_purge_interval_secs")]
  pub purge_interval_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      ttl_secs: default_ttl_secs(),
      purge_interval_secs: default_purge_interval_secs(),
    }
  }
}

fn default_ttl_secs() -> u64 {
  600
}

fn default_purge_interval_secs() -> u64 {
  60
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
  /// Filter used when RESCACHE_LOG is not set
  #[serde(default = "default_level")]
  pub level: String,
  /// Write a daily rolling log file to the data directory
  #[serde(default)]
  pub file: bool,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: default_level(),
      file: false,
    }
  }
}

fn default_level() -> String {
  "info".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./rescache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/rescache/config.yaml
  ///
  /// Without any file the defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("rescache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("rescache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.server_url()?;
    Ok(config)
  }

  pub fn server_url(&self) -> Result<Url> {
    let url = Url::parse(&self.server.url)
      .map_err(|e| eyre!("Invalid server url {}: {}", self.server.url, e))?;
    match url.scheme() {
      "http" | "https" => Ok(url),
      scheme => Err(eyre!("Unsupported scheme {} in server url", scheme)),
    }
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.server.timeout_secs)
  }

  pub fn cache_ttl(&self) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(self.cache.ttl_secs).unwrap_or(i64::MAX))
  }

  pub fn purge_interval(&self) -> Duration {
    Duration::from_secs(self.cache.purge_interval_secs.max(1))
  }

  /// Get the API token from the RESCACHE_TOKEN environment variable.
  pub fn get_api_token() -> Option<String> {
    std::env::var("RESCACHE_TOKEN").ok().filter(|t| !t.is_empty())
  }

  /// Directory for log files: $XDG_DATA_HOME/rescache
  pub fn data_dir() -> Result<PathBuf> {
    dirs::data_dir()
      .map(|dir| dir.join("rescache"))
      .ok_or_else(|| eyre!("Could not determine data directory"))
  }
}
