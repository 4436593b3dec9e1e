//! Cache layer that runs a request's strategy against the stores and the
//! network.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::key::cache_key;
use super::stores::StoreManager;
use super::types::{CacheEntry, ResponseSnapshot, Served};
use crate::classify::Category;
use crate::config::TimeoutsConfig;
use crate::error::FetchError;
use crate::fallback::OfflineResponses;
use crate::metrics::Metrics;
use crate::network::Network;
use crate::request::RequestDescriptor;
use crate::strategy::Strategy;

/// Executes caching strategies.
///
/// This layer sits between the application and the network: it decides,
/// per category, whether a response comes from a store, the network, or
/// generated offline content.
pub struct CacheLayer {
  stores: Arc<StoreManager>,
  network: Arc<dyn Network>,
  metrics: Arc<Metrics>,
  fallbacks: Arc<OfflineResponses>,
  timeouts: TimeoutsConfig,
}

impl CacheLayer {
  pub fn new(stores: Arc<StoreManager>, network: Arc<dyn Network>, metrics: Arc<Metrics>) -> Self {
    Self {
      stores,
      network,
      metrics,
      fallbacks: Arc::new(OfflineResponses::default()),
      timeouts: TimeoutsConfig::default(),
    }
  }

  /// Set the network-first time budgets.
  pub fn with_timeouts(mut self, timeouts: TimeoutsConfig) -> Self {
    self.timeouts = timeouts;
    self
  }

  pub fn with_fallbacks(mut self, fallbacks: OfflineResponses) -> Self {
    self.fallbacks = Arc::new(fallbacks);
    self
  }

  pub fn stores(&self) -> &Arc<StoreManager> {
    &self.stores
  }

  pub fn metrics(&self) -> &Arc<Metrics> {
    &self.metrics
  }

  /// Run the category's strategy and record the outcome.
  ///
  /// Never fails: when nothing can answer, the caller gets the category's
  /// offline response.
  pub async fn execute(&self, request: &RequestDescriptor, category: Category) -> Served {
    let strategy = Strategy::for_category(category);
    let store = if strategy.uses_store() {
      self.stores.store_for(category)
    } else {
      None
    };

    let served = match (strategy, store) {
      (Strategy::CacheFirst, Some(store)) => self.cache_first(request, category, store).await,
      (Strategy::NetworkFirstWithFallback, Some(store)) => {
        self.network_first(request, category, store).await
      }
      (Strategy::StaleWhileRevalidate, Some(store)) => {
        self.stale_while_revalidate(request, category, store).await
      }
      _ => self.network_only(request, category).await,
    };

    debug!(
      url = %request.url,
      %category,
      %strategy,
      source = ?served.source,
      status = served.response.status,
      "Request served"
    );
    self.metrics.record_served(category, served.source);
    served
  }

  /// Fetch a request and store the response in its category's store,
  /// outside the request path (warming, prefetching).
  ///
  /// Returns whether an entry was written.
  pub async fn refresh(
    &self,
    request: &RequestDescriptor,
    category: Category,
  ) -> Result<bool, FetchError> {
    let store = match self.stores.store_for(category) {
      Some(store) if Strategy::for_category(category).uses_store() => store,
      _ => return Ok(false),
    };

    let response = self.network.fetch(request).await?;
    Ok(self.store_if_successful(store, &cache_key(request), request, &response))
  }

  /// 1. Check cache - if present, return immediately
  /// 2. Otherwise fetch, store on success
  /// 3. On network failure, return the offline response
  async fn cache_first(
    &self,
    request: &RequestDescriptor,
    category: Category,
    store: &str,
  ) -> Served {
    let key = cache_key(request);
    if let Some(entry) = self.lookup(store, &key) {
      return Served::from_cache(entry);
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        self.store_if_successful(store, &key, request, &response);
        Served::from_network(response)
      }
      Err(err) => {
        warn!(url = %request.url, error = %err, "Cache miss and network unavailable");
        Served::fallback(self.fallbacks.for_category(category))
      }
    }
  }

  /// 1. Fetch under the category's time budget, store on success
  /// 2. On timeout or failure, serve the stored entry (offline mode)
  /// 3. With nothing stored, serve the offline response
  async fn network_first(
    &self,
    request: &RequestDescriptor,
    category: Category,
    store: &str,
  ) -> Served {
    let key = cache_key(request);
    let budget = self.timeouts.for_category(category);

    match self.fetch_within(request, budget).await {
      Ok(response) => {
        self.store_if_successful(store, &key, request, &response);
        Served::from_network(response)
      }
      Err(err) => {
        debug!(url = %request.url, error = %err, "Network unavailable, trying cache");
        match self.lookup(store, &key) {
          Some(entry) => Served::offline(entry),
          None => Served::fallback(self.fallbacks.for_category(category)),
        }
      }
    }
  }

  /// Serve the stored entry immediately and refresh it in the background.
  /// Without a stored entry this behaves like network-first.
  async fn stale_while_revalidate(
    &self,
    request: &RequestDescriptor,
    category: Category,
    store: &str,
  ) -> Served {
    let key = cache_key(request);
    match self.lookup(store, &key) {
      Some(entry) => {
        self.revalidate(request.clone(), store.to_string(), key);
        Served::stale(entry)
      }
      None => self.network_first(request, category, store).await,
    }
  }

  async fn network_only(&self, request: &RequestDescriptor, category: Category) -> Served {
    match self.network.fetch(request).await {
      Ok(response) => Served::from_network(response),
      Err(err) => {
        warn!(url = %request.url, error = %err, "Network-only request failed");
        Served::fallback(self.fallbacks.for_category(category))
      }
    }
  }

  /// Spawn a detached refresh. Its outcome is only logged; nothing awaits it.
  fn revalidate(&self, request: RequestDescriptor, store: String, key: String) {
    let layer = self.clone();
    tokio::spawn(async move {
      match layer.network.fetch(&request).await {
        Ok(response) => {
          if layer.store_if_successful(&store, &key, &request, &response) {
            debug!(url = %request.url, store = %store, "Revalidated cache entry");
          }
        }
        Err(err) => {
          warn!(url = %request.url, error = %err, "Background revalidation failed");
        }
      }
    });
  }

  /// The timed-out call is dropped, so a late response is never stored.
  async fn fetch_within(
    &self,
    request: &RequestDescriptor,
    budget: Duration,
  ) -> Result<ResponseSnapshot, FetchError> {
    match tokio::time::timeout(budget, self.network.fetch(request)).await {
      Ok(result) => result,
      Err(_) => Err(FetchError::Timeout { after: budget }),
    }
  }

  /// Store read failures count as a miss.
  fn lookup(&self, store: &str, key: &str) -> Option<CacheEntry> {
    match self.stores.get(store, key) {
      Ok(entry) => entry,
      Err(err) => {
        warn!(store, error = %err, "Failed to read cache entry");
        None
      }
    }
  }

  /// A failed write never fails the response.
  fn store_if_successful(
    &self,
    store: &str,
    key: &str,
    request: &RequestDescriptor,
    response: &ResponseSnapshot,
  ) -> bool {
    match self
      .stores
      .put_if_successful(store, key, request.url.as_str(), response)
    {
      Ok(stored) => stored,
      Err(err) => {
        warn!(store, url = %request.url, error = %err, "Failed to write cache entry");
        false
      }
    }
  }
}

impl Clone for CacheLayer {
  fn clone(&self) -> Self {
    Self {
      stores: Arc::clone(&self.stores),
      network: Arc::clone(&self.network),
      metrics: Arc::clone(&self.metrics),
      fallbacks: Arc::clone(&self.fallbacks),
      timeouts: self.timeouts,
    }
  }
}
