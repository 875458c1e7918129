use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::WriteMethod;
use crate::auth::Credentials;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub offline: OfflineConfig,
  #[serde(default)]
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL every endpoint is resolved against
  pub base_url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
  /// Cheap liveness endpoint used by the connectivity probe
  #[serde(default = "default_health_endpoint")]
  pub health_endpoint: String,
  /// Endpoint exchanging a refresh token for a new access token
  #[serde(default = "default_refresh_endpoint")]
  pub refresh_endpoint: String,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:8000/api/".to_string(),
      timeout_secs: default_timeout_secs(),
      health_endpoint: default_health_endpoint(),
      refresh_endpoint: default_refresh_endpoint(),
    }
  }
}

impl ApiConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

fn default_timeout_secs() -> u64 {
  15
}

fn default_health_endpoint() -> String {
  "health-check".to_string()
}

fn default_refresh_endpoint() -> String {
  "users/token/refresh/".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  pub probe_interval_secs: u64,
  pub probe_timeout_secs: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_interval_secs: 30,
      probe_timeout_secs: 5,
    }
  }
}

impl ConnectivityConfig {
  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs)
  }

  pub fn probe_timeout(&self) -> Duration {
    Duration::from_secs(self.probe_timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub enabled: bool,
  pub default_ttl_secs: u64,
  /// TTL table; the built-in table is used when absent
  pub policies: Option<Vec<TtlRuleConfig>>,
  /// Invalidation map; the built-in map is used when absent
  pub invalidation: Option<Vec<InvalidationRuleConfig>>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      default_ttl_secs: 60 * 60,
      policies: None,
      invalidation: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TtlRuleConfig {
  pub pattern: String,
  pub ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvalidationRuleConfig {
  pub pattern: String,
  #[serde(default)]
  pub invalidates: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
  /// How long completed operations are kept before cleanup
  pub retention_secs: u64,
  pub maintenance_interval_secs: u64,
  /// Routes replayed verbatim once connectivity returns
  pub replay: Vec<ReplayRouteConfig>,
}

impl Default for OfflineConfig {
  fn default() -> Self {
    let route = |endpoint: &str, method| ReplayRouteConfig {
      endpoint: endpoint.to_string(),
      method,
    };
    Self {
      retention_secs: 24 * 60 * 60,
      maintenance_interval_secs: 60 * 60,
      replay: vec![
        route("users/profile", WriteMethod::Patch),
        route("lottery/tickets/purchase", WriteMethod::Post),
        route("payments/deposit", WriteMethod::Post),
        route("payments/withdraw", WriteMethod::Post),
      ],
    }
  }
}

impl OfflineConfig {
  pub fn retention(&self) -> Duration {
    Duration::from_secs(self.retention_secs)
  }

  pub fn maintenance_interval(&self) -> Duration {
    Duration::from_secs(self.maintenance_interval_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplayRouteConfig {
  pub endpoint: String,
  pub method: WriteMethod,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// Database file (default: $XDG_DATA_HOME/rgw/gateway.db)
  pub path: Option<PathBuf>,
}

impl StorageConfig {
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.path {
      return Ok(path.clone());
    }
    Ok(data_dir()?.join("gateway.db"))
  }
}

/// Application data directory for the database and logs.
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("rgw"))
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./rgw.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/rgw/config.yaml
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
        "No configuration file found. Create one at ~/.config/rgw/config.yaml"
      )),
    }
  }

  /// Like [`Config::load`], but falls back to the defaults when no file exists.
  pub fn load_or_default(explicit_path: Option<&Path>) -> Result<Self> {
    if explicit_path.is_none() && Self::find_config_file().is_none() {
      return Ok(Self::default());
    }
    Self::load(explicit_path)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("rgw.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("rgw").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  /// Read credentials from the environment.
  ///
  /// `RGW_ACCESS_TOKEN` is required for any credentials to be returned;
  /// `RGW_REFRESH_TOKEN` is optional.
  pub fn credentials_from_env() -> Option<Credentials> {
    let access_token = std::env::var("RGW_ACCESS_TOKEN").ok()?;
    let refresh_token = std::env::var("RGW_REFRESH_TOKEN").ok();
    Some(Credentials {
      access_token,
      refresh_token,
    })
  }
}
