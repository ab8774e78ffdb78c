use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::{CacheVersions, Classifier};
use crate::store::SqliteStore;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin of the application, e.g. `https://app.example`
  pub origin: String,
  #[serde(default)]
  pub cache: CacheConfig,
  pub sync: SyncConfig,
  /// Database file (defaults to $XDG_DATA_HOME/ledgersync/state.db)
  pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Bootstrap resources served cache-first (paths on the origin)
  pub static_resources: Vec<String>,
  /// Path prefixes served network-first
  pub api_prefixes: Vec<String>,
  /// Hosts whose requests are always treated as API calls
  pub api_hosts: Vec<String>,
  pub api_freshness_secs: u64,
  pub snapshot_max_age_secs: u64,
  pub versions: CacheVersions,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      static_resources: vec!["/".to_string(), "/index.html".to_string()],
      api_prefixes: vec!["/api/".to_string()],
      api_hosts: Vec::new(),
      api_freshness_secs: 5 * 60,
      snapshot_max_age_secs: 24 * 60 * 60,
      versions: CacheVersions::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Endpoint queued operations are POSTed to
  pub broadcast_url: String,
  /// Probed to decide online/offline (defaults to the origin)
  pub health_url: Option<String>,
  #[serde(default = "default_dispatch_timeout")]
  pub dispatch_timeout_secs: u64,
  #[serde(default = "default_probe_interval")]
  pub probe_interval_secs: u64,
  #[serde(default = "default_request_timeout")]
  pub request_timeout_secs: u64,
}

fn default_dispatch_timeout() -> u64 {
  30
}

fn default_probe_interval() -> u64 {
  15
}

fn default_request_timeout() -> u64 {
  20
}

/// Upper bound for configured ages, well inside chrono's range.
const MAX_AGE_SECS: u64 = 100 * 365 * 24 * 60 * 60;

impl SyncConfig {
  pub fn dispatch_timeout(&self) -> Duration {
    Duration::from_secs(self.dispatch_timeout_secs)
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs.max(1))
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }
}

impl CacheConfig {
  pub fn api_freshness(&self) -> chrono::Duration {
    chrono::Duration::seconds(self.api_freshness_secs as i64)
  }

  pub fn snapshot_max_age(&self) -> chrono::Duration {
    chrono::Duration::seconds(self.snapshot_max_age_secs as i64)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./ledgersync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/ledgersync/config.yaml
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
        "No configuration file found. Create one at ~/.config/ledgersync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("ledgersync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("ledgersync").join("config.yaml");
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
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    self.origin_url()?;

    for (name, secs) in [
      ("cache.api_freshness_secs", self.cache.api_freshness_secs),
      ("cache.snapshot_max_age_secs", self.cache.snapshot_max_age_secs),
    ] {
      if secs > MAX_AGE_SECS {
        return Err(eyre!("{} must be at most {}, got {}", name, MAX_AGE_SECS, secs));
      }
    }

    if self.sync.dispatch_timeout_secs == 0 {
      return Err(eyre!("sync.dispatch_timeout_secs must be greater than 0"));
    }

    Ok(())
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  pub fn health_url(&self) -> Result<Url> {
    match &self.sync.health_url {
      Some(url) => Url::parse(url).map_err(|e| eyre!("Invalid health URL '{}': {}", url, e)),
      None => self.origin_url(),
    }
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(path) => Ok(path.clone()),
      None => SqliteStore::default_path(),
    }
  }

  /// Request classifier for the configured origin and allow-lists.
  pub fn classifier(&self) -> Result<Classifier> {
    Ok(
      Classifier::new(self.origin_url()?)
        .with_static_resources(self.cache.static_resources.iter().cloned())
        .with_api_prefixes(self.cache.api_prefixes.iter().cloned())
        .with_api_hosts(self.cache.api_hosts.iter().cloned()),
    )
  }

  /// Get the bearer token for the broadcast endpoint, if set.
  ///
  /// Checks LEDGERSYNC_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("LEDGERSYNC_API_TOKEN")
      .ok()
      .filter(|token| !token.is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::from_yaml(
      "origin: https://app.example\nsync:\n  broadcast_url: https://ledger.example/ops\n",
    )
    .unwrap();

    assert_eq!(config.cache.api_freshness_secs, 300);
    assert_eq!(config.cache.snapshot_max_age(), chrono::Duration::hours(24));
    assert_eq!(config.sync.dispatch_timeout(), Duration::from_secs(30));
    assert_eq!(config.cache.versions, CacheVersions::default());
    assert_eq!(
      config.health_url().unwrap().as_str(),
      "https://app.example/"
    );
  }

  #[test]
  fn test_full_config() {
    let yaml = r#"
origin: https://app.example
database: /tmp/ledgersync-test.db
cache:
  static_resources: ["/", "/app.js"]
  api_prefixes: ["/api/", "/rpc/"]
  api_hosts: ["ledger.example"]
  api_freshness_secs: 60
  versions:
    static: v4
    api: v2
sync:
  broadcast_url: https://ledger.example/ops
  health_url: https://ledger.example/health
  dispatch_timeout_secs: 10
"#;
    let config = Config::from_yaml(yaml).unwrap();

    assert_eq!(config.cache.api_prefixes.len(), 2);
    assert_eq!(config.cache.versions.static_assets, "v4");
    assert_eq!(config.cache.versions.dynamic, "v1");
    assert_eq!(config.cache.snapshot_max_age_secs, 86400);
    assert_eq!(
      config.database_path().unwrap(),
      PathBuf::from("/tmp/ledgersync-test.db")
    );
    assert_eq!(
      config.health_url().unwrap().as_str(),
      "https://ledger.example/health"
    );
  }

  #[test]
  fn test_out_of_range_values_are_rejected() {
    let base = "origin: https://app.example\nsync:\n  broadcast_url: https://ledger.example/ops\n";

    let huge_age = format!("{}cache:\n  snapshot_max_age_secs: 18446744073709551615\n", base);
    let err = Config::from_yaml(&huge_age).unwrap_err();
    assert!(err.to_string().contains("snapshot_max_age_secs"));

    let huge_freshness = format!("{}cache:\n  api_freshness_secs: 9223372036854775807\n", base);
    assert!(Config::from_yaml(&huge_freshness).is_err());

    let zero_timeout = format!("{}  dispatch_timeout_secs: 0\n", base);
    let err = Config::from_yaml(&zero_timeout).unwrap_err();
    assert!(err.to_string().contains("dispatch_timeout_secs"));
  }

  #[test]
  fn test_invalid_origin_is_rejected() {
    let result = Config::from_yaml("origin: not a url\nsync:\n  broadcast_url: x\n");
    assert!(result.is_err());
  }
}
