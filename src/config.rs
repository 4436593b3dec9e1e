use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::classify::Category;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Base URL that relative request paths are resolved against
  pub origin: String,
  /// Layer version label; a change installs as pending until activated
  pub version: String,
  pub storage: StorageConfig,
  pub stores: Vec<StoreConfig>,
  /// Default maximum entry age for stores without their own retention
  pub retention_days: u64,
  pub eviction_interval_secs: u64,
  pub timeouts: TimeoutsConfig,
  pub classifier: ClassifierConfig,
  /// HTML file served to navigations when offline (built-in page otherwise)
  pub offline_page: Option<PathBuf>,
  /// Queue failed non-safe requests for replay on reconnect
  pub defer_failed_writes: bool,
  /// Additional log destination
  pub log_file: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:8080".to_string(),
      version: env!("CARGO_PKG_VERSION").to_string(),
      storage: StorageConfig::default(),
      stores: default_stores(),
      retention_days: 7,
      eviction_interval_secs: 24 * 60 * 60,
      timeouts: TimeoutsConfig::default(),
      classifier: ClassifierConfig::default(),
      offline_page: None,
      defer_failed_writes: true,
      log_file: None,
    }
  }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
  /// Entries survive restarts in a local SQLite file
  #[default]
  Sqlite,
  /// Process-lifetime maps
  Memory,
  /// Caching disabled: every lookup misses
  None,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  pub backend: StorageBackend,
  /// SQLite database file (default: $XDG_DATA_HOME/cachegate/cache.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
  pub name: String,
  pub category: Category,
  pub retention_days: Option<u64>,
}

impl StoreConfig {
  fn new(name: &str, category: Category) -> Self {
    Self {
      name: name.to_string(),
      category,
      retention_days: None,
    }
  }
}

fn default_stores() -> Vec<StoreConfig> {
  vec![
    StoreConfig::new("static", Category::StaticAsset),
    StoreConfig::new("api", Category::ApiResource),
    StoreConfig::new("images", Category::Image),
    StoreConfig::new("pages", Category::Navigation),
    StoreConfig::new("dynamic", Category::DynamicOther),
  ]
}

/// Network-first time budgets in milliseconds.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
  pub api_ms: u64,
  pub navigation_ms: u64,
  pub image_ms: u64,
  pub dynamic_ms: u64,
}

impl Default for TimeoutsConfig {
  fn default() -> Self {
    Self {
      api_ms: 3_000,
      navigation_ms: 5_000,
      image_ms: 5_000,
      dynamic_ms: 4_000,
    }
  }
}

impl TimeoutsConfig {
  pub fn for_category(&self, category: Category) -> Duration {
    let ms = match category {
      Category::ApiResource => self.api_ms,
      Category::Navigation => self.navigation_ms,
      Category::Image => self.image_ms,
      _ => self.dynamic_ms,
    };
    Duration::from_millis(ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
  /// Path prefixes that must never touch a cache store
  pub sensitive_prefixes: Vec<String>,
  pub api_prefixes: Vec<String>,
  pub static_extensions: Vec<String>,
  pub image_extensions: Vec<String>,
}

impl Default for ClassifierConfig {
  fn default() -> Self {
    let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
    Self {
      sensitive_prefixes: strings(&[
        "/api/auth",
        "/auth",
        "/api/payment",
        "/api/payments",
        "/payment",
        "/api/admin",
        "/admin",
        "/api/user/delete",
        "/api/account/delete",
      ]),
      api_prefixes: strings(&["/api/"]),
      static_extensions: strings(&[
        "js", "mjs", "css", "woff", "woff2", "ttf", "otf", "eot", "map", "wasm",
      ]),
      image_extensions: strings(&[
        "png", "jpg", "jpeg", "gif", "webp", "svg", "ico", "avif", "bmp",
      ]),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./cachegate.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/cachegate/config.yaml
  ///
  /// Falls back to built-in defaults when nothing is found.
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
    let local = PathBuf::from("cachegate.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("cachegate").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
  }

  /// Reject values that cannot be turned into the durations the layer uses.
  pub fn validate(&self) -> Result<()> {
    for store in &self.stores {
      self.retention_for(store)?;
    }
    Ok(())
  }

  pub fn origin_url(&self) -> Result<url::Url> {
    url::Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  pub fn eviction_interval(&self) -> Duration {
    Duration::from_secs(self.eviction_interval_secs.max(1))
  }

  /// Retention for a configured store, falling back to the global default.
  ///
  /// The retention must be subtractable from the current time, so that an
  /// eviction cutoff always exists.
  pub fn retention_for(&self, store: &StoreConfig) -> Result<chrono::Duration> {
    let days = store.retention_days.unwrap_or(self.retention_days);
    i64::try_from(days)
      .ok()
      .and_then(chrono::Duration::try_days)
      .filter(|retention| Utc::now().checked_sub_signed(*retention).is_some())
      .ok_or_else(|| {
        eyre!(
          "Retention of {} days for store '{}' is out of range",
          days,
          store.name
        )
      })
  }

  /// The offline document body, read from `offline_page` when configured.
  pub fn offline_page_html(&self) -> Result<Option<String>> {
    match &self.offline_page {
      Some(path) => std::fs::read_to_string(path)
        .map(Some)
        .map_err(|e| eyre!("Failed to read offline page {}: {}", path.display(), e)),
      None => Ok(None),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config = Config::default();
    assert_eq!(config.stores.len(), 5);
    assert_eq!(config.retention_days, 7);
    assert_eq!(config.eviction_interval(), Duration::from_secs(86_400));
    assert_eq!(
      config.timeouts.for_category(Category::ApiResource),
      Duration::from_secs(3)
    );
  }

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config = Config::from_yaml(
      r#"
origin: "https://app.example.com"
storage:
  backend: memory
stores:
  - name: images
    category: image
    retention_days: 30
  - name: static
    category: static_asset
timeouts:
  api_ms: 1500
"#,
    )
    .unwrap();

    assert_eq!(config.origin, "https://app.example.com");
    assert_eq!(config.storage.backend, StorageBackend::Memory);
    assert_eq!(config.stores.len(), 2);
    assert_eq!(
      config.retention_for(&config.stores[0]).unwrap(),
      chrono::Duration::days(30)
    );
    assert_eq!(
      config.retention_for(&config.stores[1]).unwrap(),
      chrono::Duration::days(7)
    );
    assert_eq!(config.timeouts.api_ms, 1500);
    assert_eq!(config.timeouts.navigation_ms, 5000);
    assert!(!config.classifier.sensitive_prefixes.is_empty());
  }

  #[test]
  fn test_out_of_range_retention_is_rejected() {
    // Would wrap to a negative duration if cast
    let wrapped = Config::from_yaml("retention_days: 18446744073709551615\n");
    assert!(wrapped.is_err());

    // Fits a duration, but reaches back past the earliest representable date
    let too_far = Config::from_yaml("retention_days: 1000000000\n");
    assert!(too_far.is_err());

    let per_store = Config::from_yaml(
      r#"
stores:
  - name: images
    category: image
    retention_days: 1000000000
"#,
    );
    let message = per_store.unwrap_err().to_string();
    assert!(message.contains("images"), "{}", message);
  }

  #[test]
  fn test_large_retention_within_range_is_accepted() {
    let config = Config::from_yaml("retention_days: 36500\n").unwrap();
    assert_eq!(
      config.retention_for(&config.stores[0]).unwrap(),
      chrono::Duration::days(36_500)
    );
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let result = Config::load(Some(Path::new("/nonexistent/cachegate.yaml")));
    assert!(result.is_err());
  }
}
