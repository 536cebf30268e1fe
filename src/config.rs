use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cache::CacheSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub backend: BackendConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  /// Base URL of the REST API, e.g. https://cloud.appwrite.io/v1
  pub endpoint: String,
  pub project_id: String,
  pub database_id: String,
  /// Documents per page of the infinite feed
  #[serde(default = "default_page_size")]
  pub page_size: u32,
  #[serde(default)]
  pub collections: CollectionsConfig,
}

fn default_page_size() -> u32 {
  9
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectionsConfig {
  pub posts: String,
  pub users: String,
  pub comments: String,
  pub saves: String,
}

impl Default for CollectionsConfig {
  fn default() -> Self {
    Self {
      posts: "posts".to_string(),
      users: "users".to_string(),
      comments: "comments".to_string(),
      saves: "saves".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_stale_time")]
  pub stale_time_secs: i64,
  #[serde(default = "default_gc_time")]
  pub gc_time_secs: i64,
}

fn default_stale_time() -> i64 {
  60
}

fn default_gc_time() -> i64 {
  300
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_time_secs: default_stale_time(),
      gc_time_secs: default_gc_time(),
    }
  }
}

impl CacheConfig {
  pub fn settings(&self) -> CacheSettings {
    CacheSettings {
      stale_time: chrono::Duration::seconds(self.stale_time_secs.max(0)),
      gc_time: chrono::Duration::seconds(self.gc_time_secs.max(0)),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
  /// Default filter directive; `RUST_LOG` takes precedence
  #[serde(default = "default_level")]
  pub level: String,
  /// Write logs to this file instead of stderr
  pub file: Option<PathBuf>,
}

fn default_level() -> String {
  "info".to_string()
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: default_level(),
      file: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./murmur.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/murmur/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/murmur/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("murmur.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("murmur").join("config.yaml");
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

  fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Optional server API key from `MURMUR_API_KEY`.
  pub fn get_api_key() -> Option<String> {
    std::env::var("MURMUR_API_KEY")
      .ok()
      .filter(|key| !key.trim().is_empty())
  }
}
