use color_eyre::{
  eyre::{eyre, WrapErr},
  Result,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::SnapshotPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  /// Where the database and logs live (defaults to $XDG_DATA_HOME/mesa)
  pub data_dir: Option<PathBuf>,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub network: NetworkConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL of the REST backend, e.g. https://api.example.com/v1
  pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub max_entries: usize,
  pub default_ttl_ms: u64,
  pub cleanup_interval_secs: u64,
  pub snapshot_max_entries: usize,
  /// Entries written within this window are snapshotted regardless of priority
  pub snapshot_recent_window_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      max_entries: 500,
      default_ttl_ms: 5 * 60 * 1000,
      cleanup_interval_secs: 60,
      snapshot_max_entries: 200,
      snapshot_recent_window_secs: 10 * 60,
    }
  }
}

impl CacheConfig {
  pub fn default_ttl(&self) -> Duration {
    Duration::from_millis(self.default_ttl_ms)
  }

  pub fn cleanup_interval(&self) -> Duration {
    Duration::from_secs(self.cleanup_interval_secs.max(1))
  }

  pub fn snapshot_policy(&self) -> SnapshotPolicy {
    SnapshotPolicy {
      max_entries: self.snapshot_max_entries,
      recent_window: Duration::from_secs(self.snapshot_recent_window_secs),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Byte budget for the durable store; unlimited when unset
  pub quota_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Periodic drain interval while online
  pub interval_secs: u64,
  /// Upper bound for a single replayed request
  pub request_timeout_ms: u64,
  /// Failed attempts after which an operation is discarded
  pub max_retries: u32,
  pub backoff_base_ms: u64,
  pub backoff_max_ms: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      interval_secs: 30,
      request_timeout_ms: 10_000,
      max_retries: 5,
      backoff_base_ms: 2_000,
      backoff_max_ms: 5 * 60 * 1000,
    }
  }
}

impl SyncConfig {
  pub fn interval(&self) -> Duration {
    Duration::from_secs(self.interval_secs.max(1))
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_millis(self.request_timeout_ms)
  }

  /// Delay before the next attempt after `retry_count` failures.
  ///
  /// Doubles from `backoff_base_ms` and saturates at `backoff_max_ms`.
  pub fn backoff(&self, retry_count: u32) -> Duration {
    if retry_count == 0 {
      return Duration::ZERO;
    }
    let factor = 1u64.checked_shl(retry_count - 1).unwrap_or(u64::MAX);
    let ms = self
      .backoff_base_ms
      .saturating_mul(factor)
      .min(self.backoff_max_ms);
    Duration::from_millis(ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub probe_interval_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      probe_interval_secs: 15,
    }
  }
}

impl NetworkConfig {
  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs.max(1))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Filter directive used when MESA_LOG is unset
  pub level: String,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
    }
  }
}

impl Config {
  /// Read the configuration from `explicit_path`, or from the first of
  /// the candidate paths that exists.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = match explicit_path {
      Some(path) if path.is_file() => path.to_path_buf(),
      Some(path) => return Err(eyre!("config file {} does not exist", path.display())),
      None => {
        let candidates = Self::candidate_paths();
        match candidates.iter().find(|p| p.is_file()) {
          Some(path) => path.clone(),
          None => {
            let searched: Vec<String> = candidates.iter().map(|p| p.display().to_string()).collect();
            return Err(eyre!(
              "no config file found (looked for {}); it needs at least an `api.url` entry",
              searched.join(", ")
            ));
          }
        }
      }
    };

    let contents = std::fs::read_to_string(&path).wrap_err_with(|| format!("reading {}", path.display()))?;
    Self::parse(&contents).wrap_err_with(|| format!("parsing {}", path.display()))
  }

  /// `./mesa.yaml`, then `mesa/config.yaml` under the user config directory.
  fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("mesa.yaml")];
    paths.extend(dirs::config_dir().map(|dir| dir.join("mesa").join("config.yaml")));
    paths
  }

  fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Resolve the data directory.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("mesa"))
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("mesa.db"))
  }

  pub fn log_dir(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("logs"))
  }

  /// Get the API bearer token from the environment, if any.
  ///
  /// Checks MESA_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("MESA_API_TOKEN")
      .ok()
      .filter(|t| !t.trim().is_empty())
  }
}
