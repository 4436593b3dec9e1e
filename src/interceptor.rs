//! The entry point every outbound request goes through.

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{
  CacheLayer, CacheStorage, EvictionScheduler, MemoryStorage, NoopStorage, ResponseSnapshot,
  SchedulerHandle, Served, SqliteStorage, StoreManager,
};
use crate::classify::{Category, Classifier};
use crate::config::{Config, StorageBackend};
use crate::error::CommandError;
use crate::fallback::OfflineResponses;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::network::{HttpNetwork, Network};
use crate::request::{resolve_url, RequestDescriptor};
use crate::retry::{DeferredRequest, DrainReport, MemoryTaskLog, RetryQueue, TaskLog};

/// Active layer version, plus one waiting for activation if the configured
/// version differs from the one the backend last recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerVersion {
  pub active: String,
  pub pending: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Activation {
  pub version: String,
  pub purged_stores: Vec<String>,
}

#[derive(Clone)]
pub struct Interceptor {
  classifier: Arc<Classifier>,
  layer: CacheLayer,
  retry: RetryQueue,
  network: Arc<dyn Network>,
  version: Arc<Mutex<LayerVersion>>,
  origin: Url,
  defer_failed_writes: bool,
  eviction_interval: Duration,
}

impl Interceptor {
  /// Build the layer with the configured storage backend and a real HTTP
  /// client.
  pub fn from_config(config: &Config) -> Result<Self> {
    let network: Arc<dyn Network> = Arc::new(HttpNetwork::new()?);

    match config.storage.backend {
      StorageBackend::Sqlite => {
        let storage = Arc::new(match &config.storage.path {
          Some(path) => SqliteStorage::open_at(path)?,
          None => SqliteStorage::open()?,
        });
        Self::new(config, storage.clone(), storage, network)
      }
      StorageBackend::Memory => Self::new(
        config,
        Arc::new(MemoryStorage::new()),
        Arc::new(MemoryTaskLog::new()),
        network,
      ),
      StorageBackend::None => Self::new(
        config,
        Arc::new(NoopStorage),
        Arc::new(MemoryTaskLog::new()),
        network,
      ),
    }
  }

  pub fn new(
    config: &Config,
    storage: Arc<dyn CacheStorage>,
    tasks: Arc<dyn TaskLog>,
    network: Arc<dyn Network>,
  ) -> Result<Self> {
    let origin = config.origin_url()?;
    let stores = Arc::new(StoreManager::from_config(storage.clone(), config)?);
    let fallbacks = match config.offline_page_html()? {
      Some(page) => OfflineResponses::with_page(page),
      None => OfflineResponses::default(),
    };
    let layer = CacheLayer::new(stores, network.clone(), Arc::new(Metrics::new()))
      .with_timeouts(config.timeouts)
      .with_fallbacks(fallbacks);

    let version = match storage.recorded_version()? {
      None => {
        storage.record_version(&config.version)?;
        LayerVersion {
          active: config.version.clone(),
          pending: None,
        }
      }
      Some(recorded) if recorded == config.version => LayerVersion {
        active: recorded,
        pending: None,
      },
      Some(recorded) => {
        info!(
          active = %recorded,
          pending = %config.version,
          "New layer version installed, waiting for activation"
        );
        LayerVersion {
          active: recorded,
          pending: Some(config.version.clone()),
        }
      }
    };

    Ok(Self {
      classifier: Arc::new(Classifier::new(&config.classifier)),
      layer,
      retry: RetryQueue::new(tasks, network.clone()),
      network,
      version: Arc::new(Mutex::new(version)),
      origin,
      defer_failed_writes: config.defer_failed_writes,
      eviction_interval: config.eviction_interval(),
    })
  }

  /// Serve a request. Reads go through their category's strategy; anything
  /// else bypasses the cache entirely.
  pub async fn handle(&self, request: RequestDescriptor) -> Served {
    if !request.is_safe() {
      return self.pass_through(request).await;
    }

    let category = self.classifier.classify(&request);
    self.layer.execute(&request, category).await
  }

  /// GET an absolute URL or a path relative to the origin.
  pub async fn get(&self, url: &str) -> Result<Served> {
    let url = self.resolve(url)?;
    Ok(self.handle(RequestDescriptor::get(url)).await)
  }

  /// Load a URL as a top-level document.
  pub async fn navigate(&self, url: &str) -> Result<Served> {
    let url = self.resolve(url)?;
    Ok(self.handle(RequestDescriptor::navigate(url)).await)
  }

  pub fn resolve(&self, url: &str) -> Result<Url> {
    resolve_url(&self.origin, url).map_err(|e| eyre!("Invalid url '{}': {}", url, e))
  }

  pub fn classify(&self, request: &RequestDescriptor) -> Category {
    self.classifier.classify(request)
  }

  async fn pass_through(&self, request: RequestDescriptor) -> Served {
    debug!(method = %request.method, url = %request.url, "Bypassing cache");

    let err = match self.network.fetch(&request).await {
      Ok(response) => return Served::from_network(response),
      Err(err) => err,
    };
    warn!(method = %request.method, url = %request.url, error = %err, "Request failed");

    if !self.defer_failed_writes {
      return Served::fallback(OfflineResponses::offline_error());
    }

    match self.retry.enqueue(DeferredRequest::from_descriptor(&request)) {
      Ok(id) => Served::fallback(ResponseSnapshot::json(
        503,
        &json!({ "error": "offline", "queued": id.to_string() }),
      )),
      Err(e) => {
        warn!(url = %request.url, error = %e, "Failed to queue deferred request");
        Served::fallback(OfflineResponses::offline_error())
      }
    }
  }

  /// Promote the pending version, then purge stores the new version no
  /// longer manages.
  pub fn activate_now(&self) -> Result<Activation, CommandError> {
    let activated = {
      let mut version = self
        .version
        .lock()
        .map_err(|e| CommandError::Storage(format!("Lock poisoned: {}", e)))?;
      let pending = version.pending.clone().ok_or(CommandError::NothingPending)?;

      self.stores().storage().record_version(&pending)?;
      version.active = pending.clone();
      version.pending = None;
      pending
    };

    let purged_stores = self.stores().purge_unmanaged()?;
    info!(version = %activated, purged = purged_stores.len(), "Layer version activated");

    Ok(Activation {
      version: activated,
      purged_stores,
    })
  }

  pub fn version(&self) -> LayerVersion {
    match self.version.lock() {
      Ok(version) => version.clone(),
      Err(poisoned) => poisoned.into_inner().clone(),
    }
  }

  /// Connectivity is back: replay deferred requests.
  pub async fn connectivity_restored(&self) -> DrainReport {
    self.retry.drain().await
  }

  pub fn retry(&self) -> &RetryQueue {
    &self.retry
  }

  pub fn layer(&self) -> &CacheLayer {
    &self.layer
  }

  pub fn stores(&self) -> &Arc<StoreManager> {
    self.layer.stores()
  }

  pub fn metrics(&self) -> MetricsSnapshot {
    self.layer.metrics().snapshot()
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }

  pub fn scheduler(&self) -> EvictionScheduler {
    EvictionScheduler::new(Arc::clone(self.stores()), self.eviction_interval)
  }

  /// Start background eviction.
  pub fn start(&self) -> SchedulerHandle {
    info!(interval_secs = self.eviction_interval.as_secs(), "Starting eviction scheduler");
    self.scheduler().spawn()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheEntry, CacheSource};
  use crate::network::testing::ScriptedNetwork;
  use reqwest::Method;

  fn config() -> Config {
    Config {
      storage: crate::config::StorageConfig {
        backend: StorageBackend::Memory,
        path: None,
      },
      version: "1.0.0".to_string(),
      ..Config::default()
    }
  }

  fn interceptor(network: Arc<ScriptedNetwork>) -> Interceptor {
    Interceptor::new(
      &config(),
      Arc::new(MemoryStorage::new()),
      Arc::new(MemoryTaskLog::new()),
      network,
    )
    .unwrap()
  }

  fn post(interceptor: &Interceptor, path: &str) -> RequestDescriptor {
    RequestDescriptor::new(Method::POST, interceptor.resolve(path).unwrap()).with_body("{}")
  }

  #[tokio::test]
  async fn test_reads_are_cached_by_category() {
    let network = ScriptedNetwork::new();
    network.respond("/static/app.css", 200, "css");
    let interceptor = interceptor(network.clone());

    let first = interceptor.get("/static/app.css").await.unwrap();
    let second = interceptor.get("/static/app.css").await.unwrap();

    assert_eq!(first.source, CacheSource::Network);
    assert_eq!(second.source, CacheSource::CacheFresh);
    assert_eq!(network.calls(), 1);
    assert_eq!(interceptor.metrics().hits, 1);
  }

  #[tokio::test]
  async fn test_navigation_offline_gets_offline_page() {
    let network = ScriptedNetwork::new();
    network.fail("/worlds");
    let interceptor = interceptor(network);

    let served = interceptor.navigate("/worlds").await.unwrap();
    assert_eq!(served.response.status, 200);
    assert!(String::from_utf8_lossy(&served.response.body).contains("offline"));
  }

  #[tokio::test]
  async fn test_unsafe_methods_bypass_cache() {
    let network = ScriptedNetwork::new();
    network.respond("/api/worlds", 201, "created");
    let interceptor = interceptor(network.clone());

    let served = interceptor.handle(post(&interceptor, "/api/worlds")).await;
    assert_eq!(served.response.status, 201);

    let stores = interceptor.stores();
    assert!(stores.names().all(|name| stores.list_keys(name).unwrap().is_empty()));
    let metrics = interceptor.metrics();
    assert_eq!(metrics.hits + metrics.misses + metrics.network_requests, 0);
  }

  #[tokio::test]
  async fn test_failed_write_is_queued_and_replayed() {
    let network = ScriptedNetwork::new();
    network.fail("/api/orders");
    let interceptor = interceptor(network.clone());

    let served = interceptor.handle(post(&interceptor, "/api/orders")).await;
    assert_eq!(served.response.status, 503);
    let body: serde_json::Value = serde_json::from_slice(&served.response.body).unwrap();
    assert_eq!(body["error"], "offline");

    let pending = interceptor.retry().pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(body["queued"], pending[0].id.to_string());
    assert_eq!(pending[0].payload.method, "POST");

    network.respond("/api/orders", 200, "ok");
    let report = interceptor.connectivity_restored().await;
    assert_eq!(report, DrainReport { succeeded: 1, remaining: 0 });
  }

  #[tokio::test]
  async fn test_deferral_can_be_disabled() {
    let network = ScriptedNetwork::new();
    network.fail("/api/orders");
    let config = Config {
      defer_failed_writes: false,
      ..config()
    };
    let interceptor = Interceptor::new(
      &config,
      Arc::new(MemoryStorage::new()),
      Arc::new(MemoryTaskLog::new()),
      network,
    )
    .unwrap();

    let served = interceptor.handle(post(&interceptor, "/api/orders")).await;
    assert_eq!(served.response.status, 503);
    assert!(interceptor.retry().pending().unwrap().is_empty());
  }

  #[test]
  fn test_first_install_activates_immediately() {
    let storage = Arc::new(MemoryStorage::new());
    let interceptor = Interceptor::new(
      &config(),
      storage.clone(),
      Arc::new(MemoryTaskLog::new()),
      ScriptedNetwork::new(),
    )
    .unwrap();

    assert_eq!(interceptor.version().active, "1.0.0");
    assert_eq!(interceptor.version().pending, None);
    assert_eq!(storage.recorded_version().unwrap(), Some("1.0.0".to_string()));
    assert!(matches!(
      interceptor.activate_now(),
      Err(CommandError::NothingPending)
    ));
  }

  #[test]
  fn test_new_version_waits_for_activation() {
    let storage = Arc::new(MemoryStorage::new());
    storage.record_version("0.9.0").unwrap();
    let orphan = CacheEntry::new(
      "k".to_string(),
      "http://localhost:8080/old.css".to_string(),
      ResponseSnapshot::new(200, "old"),
    );
    storage.put("static-v0", &orphan).unwrap();

    let interceptor = Interceptor::new(
      &config(),
      storage.clone(),
      Arc::new(MemoryTaskLog::new()),
      ScriptedNetwork::new(),
    )
    .unwrap();
    assert_eq!(
      interceptor.version(),
      LayerVersion {
        active: "0.9.0".to_string(),
        pending: Some("1.0.0".to_string()),
      }
    );

    let activation = interceptor.activate_now().unwrap();
    assert_eq!(activation.version, "1.0.0");
    assert_eq!(activation.purged_stores, vec!["static-v0".to_string()]);
    assert_eq!(interceptor.version().pending, None);
    assert_eq!(storage.recorded_version().unwrap(), Some("1.0.0".to_string()));
    assert!(matches!(
      interceptor.activate_now(),
      Err(CommandError::NothingPending)
    ));
  }
}
