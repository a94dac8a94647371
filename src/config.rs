use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::{LayerSettings, PartitionNamer, PolicyConfig, PolicyTable, ResourceClass, Strategy};

/// Environment variable that replaces `cache.version`.
pub const VERSION_ENV: &str = "TIERCACHE_VERSION";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub cache: CacheConfig,
  pub policies: PoliciesConfig,
  pub memory: MemoryConfig,
  pub control: ControlConfig,
  pub cleanup: CleanupConfig,
  pub network: NetworkConfig,
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Partition name prefix
  pub prefix: String,
  /// Partition version tag; bumping it retires every older partition on activation
  pub version: String,
  /// Origin that relative seed assets resolve against
  pub origin: String,
  /// Hosts whose every request is API data
  pub api_hosts: Vec<String>,
  /// Assets fetched and stored during install
  pub seed_assets: Vec<String>,
  pub shell_path: String,
  pub placeholder_path: String,
  /// Where the SQLite files live (defaults to the user data directory)
  pub data_dir: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: "tiercache".to_string(),
      version: "v1".to_string(),
      origin: "http://localhost:8080/".to_string(),
      api_hosts: Vec::new(),
      seed_assets: vec!["/".to_string()],
      shell_path: "/".to_string(),
      placeholder_path: "/placeholder.svg".to_string(),
      data_dir: None,
    }
  }
}

/// Per-class overrides; unset fields keep the built-in policy.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PoliciesConfig {
  #[serde(rename = "static")]
  pub static_assets: PolicyOverride,
  pub api: PolicyOverride,
  pub images: PolicyOverride,
  pub dynamic: PolicyOverride,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PolicyOverride {
  pub strategy: Option<Strategy>,
  pub max_age_secs: Option<u64>,
  pub max_entries: Option<usize>,
}

impl PolicyOverride {
  fn apply(&self, base: PolicyConfig) -> PolicyConfig {
    PolicyConfig {
      strategy: self.strategy.unwrap_or(base.strategy),
      max_age: self.max_age_secs.map(Duration::from_secs).unwrap_or(base.max_age),
      max_entries: self.max_entries.unwrap_or(base.max_entries),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
  pub max_size: usize,
  pub default_ttl_secs: u64,
  /// Largest accepted encoded value, in bytes
  pub max_entry_bytes: usize,
}

impl Default for MemoryConfig {
  fn default() -> Self {
    Self {
      max_size: 100,
      default_ttl_secs: 5 * 60,
      max_entry_bytes: 1024 * 1024,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
  pub timeout_ms: u64,
}

impl Default for ControlConfig {
  fn default() -> Self {
    Self { timeout_ms: 1000 }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
  pub interval_secs: u64,
}

impl Default for CleanupConfig {
  fn default() -> Self {
    Self { interval_secs: 60 }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub timeout_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self { timeout_secs: 10 }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Filter directive used when TIERCACHE_LOG is unset
  pub level: String,
  /// Write daily log files here instead of stderr
  pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      directory: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tiercache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tiercache/config.yaml
  ///
  /// Without a file the defaults apply.
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

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.override_version(std::env::var(VERSION_ENV).ok());

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("tiercache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tiercache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  fn override_version(&mut self, version: Option<String>) {
    if let Some(version) = version.filter(|v| !v.trim().is_empty()) {
      self.cache.version = version.trim().to_string();
    }
  }

  /// Built-in policies with the configured overrides applied.
  pub fn policy_table(&self) -> PolicyTable {
    let mut table = PolicyTable::default();
    for class in ResourceClass::ALL {
      let overrides = match class {
        ResourceClass::Static => &self.policies.static_assets,
        ResourceClass::Api => &self.policies.api,
        ResourceClass::Image => &self.policies.images,
        ResourceClass::Dynamic => &self.policies.dynamic,
      };
      table.set(class, overrides.apply(*table.get(class)));
    }
    table
  }

  pub fn layer_settings(&self) -> LayerSettings {
    LayerSettings {
      policies: self.policy_table(),
      namer: PartitionNamer::new(&self.cache.prefix, &self.cache.version),
      api_hosts: self.cache.api_hosts.clone(),
      shell_path: self.cache.shell_path.clone(),
      placeholder_path: self.cache.placeholder_path.clone(),
    }
  }

  /// Seed assets resolved against the origin.
  pub fn seed_urls(&self) -> Result<Vec<Url>> {
    let origin = Url::parse(&self.cache.origin)
      .map_err(|e| eyre!("Invalid origin {}: {}", self.cache.origin, e))?;

    self
      .cache
      .seed_assets
      .iter()
      .map(|asset| {
        origin
          .join(asset)
          .map_err(|e| eyre!("Invalid seed asset {}: {}", asset, e))
      })
      .collect()
  }

  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.cache.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("tiercache"))
  }

  /// SQLite file backing the interception-layer partitions.
  pub fn partitions_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("partitions.db"))
  }

  /// SQLite file backing the persistent key/value tier.
  pub fn store_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("store.db"))
  }

  pub fn control_timeout(&self) -> Duration {
    Duration::from_millis(self.control.timeout_ms)
  }

  pub fn cleanup_interval(&self) -> Duration {
    Duration::from_secs(self.cleanup.interval_secs.max(1))
  }

  pub fn network_timeout(&self) -> Duration {
    Duration::from_secs(self.network.timeout_secs)
  }

  pub fn memory_ttl(&self) -> Duration {
    Duration::from_secs(self.memory.default_ttl_secs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
  }

  #[test]
  fn test_defaults() {
    let config = Config::default();
    assert_eq!(config.control_timeout(), Duration::from_secs(1));
    assert_eq!(config.memory.max_size, 100);
    assert_eq!(config.policy_table(), PolicyTable::default());
    assert_eq!(config.layer_settings().namer.current_prefix(), "tiercache-v1-");
  }

  #[test]
  fn test_load_partial_file() {
    let file = write_config(
      r#"
cache:
  version: v7
  origin: https://shop.test/
  api_hosts: [db.backend.test]
  seed_assets: ["/", "/app.js"]
policies:
  api:
    max_age_secs: 60
  static:
    strategy: stale-while-revalidate
control:
  timeout_ms: 250
"#,
    );

    let config = Config::load_from_path(file.path()).unwrap();
    assert_eq!(config.cache.prefix, "tiercache");
    assert_eq!(config.control_timeout(), Duration::from_millis(250));

    let table = config.policy_table();
    assert_eq!(table.api.max_age, Duration::from_secs(60));
    assert_eq!(table.api.strategy, Strategy::NetworkFirst);
    assert_eq!(table.static_assets.strategy, Strategy::StaleWhileRevalidate);
    assert_eq!(table.static_assets.max_entries, 100);

    let seeds: Vec<String> = config.seed_urls().unwrap().iter().map(Url::to_string).collect();
    assert_eq!(seeds, vec!["https://shop.test/", "https://shop.test/app.js"]);
    assert_eq!(config.layer_settings().api_hosts, vec!["db.backend.test"]);
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(Config::load(Some(&dir.path().join("nope.yaml"))).is_err());
  }

  #[test]
  fn test_invalid_yaml_is_an_error() {
    let file = write_config("policies:\n  api:\n    strategy: sometimes\n");
    assert!(Config::load_from_path(file.path()).is_err());
  }

  #[test]
  fn test_version_override() {
    let mut config = Config::default();
    config.override_version(Some("  ".to_string()));
    assert_eq!(config.cache.version, "v1");
    config.override_version(Some("v2".to_string()));
    assert_eq!(config.layer_settings().namer.name_for(ResourceClass::Api), "tiercache-v2-api");
  }

  #[test]
  fn test_data_paths() {
    let mut config = Config::default();
    config.cache.data_dir = Some(PathBuf::from("/var/lib/tiercache"));
    assert_eq!(
      config.partitions_path().unwrap(),
      PathBuf::from("/var/lib/tiercache/partitions.db")
    );
    assert_eq!(config.store_path().unwrap(), PathBuf::from("/var/lib/tiercache/store.db"));
  }
}
