//! Named cache stores over a storage backend.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::storage::CacheStorage;
use super::types::{CacheEntry, ResponseSnapshot};
use crate::classify::Category;
use crate::config::Config;

/// A store's identity and retention policy.
#[derive(Debug, Clone)]
pub struct StoreSpec {
  pub name: String,
  pub category: Category,
  /// Entries older than this are removed by the eviction scheduler
  pub retention: chrono::Duration,
}

impl StoreSpec {
  pub fn new(name: &str, category: Category, retention: chrono::Duration) -> Self {
    Self {
      name: name.to_string(),
      category,
      retention,
    }
  }
}

/// Registry of the stores created at layer initialization.
///
/// The set of stores is fixed once constructed; entries within them are
/// read and written one key at a time.
pub struct StoreManager {
  storage: Arc<dyn CacheStorage>,
  specs: Vec<StoreSpec>,
  by_category: HashMap<Category, usize>,
}

impl StoreManager {
  pub fn new(storage: Arc<dyn CacheStorage>, specs: Vec<StoreSpec>) -> Result<Self> {
    let mut by_category = HashMap::new();

    for (index, spec) in specs.iter().enumerate() {
      if spec.category == Category::Sensitive {
        return Err(eyre!(
          "Store '{}' cannot hold sensitive requests; they are never cached",
          spec.name
        ));
      }
      if spec.retention < chrono::Duration::zero() {
        return Err(eyre!("Store '{}' has a negative retention", spec.name));
      }
      if specs[..index].iter().any(|other| other.name == spec.name) {
        return Err(eyre!("Duplicate cache store name: {}", spec.name));
      }
      if by_category.insert(spec.category, index).is_some() {
        return Err(eyre!(
          "More than one store configured for category {}",
          spec.category
        ));
      }
    }

    debug!(stores = specs.len(), "Cache stores registered");
    Ok(Self {
      storage,
      specs,
      by_category,
    })
  }

  /// Build the store set described by the configuration.
  pub fn from_config(storage: Arc<dyn CacheStorage>, config: &Config) -> Result<Self> {
    let specs = config
      .stores
      .iter()
      .map(|store| {
        let retention = config.retention_for(store)?;
        Ok(StoreSpec::new(&store.name, store.category, retention))
      })
      .collect::<Result<Vec<_>>>()?;
    Self::new(storage, specs)
  }

  pub fn specs(&self) -> &[StoreSpec] {
    &self.specs
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.specs.iter().map(|spec| spec.name.as_str())
  }

  pub fn contains(&self, store: &str) -> bool {
    self.specs.iter().any(|spec| spec.name == store)
  }

  /// The store that holds responses for a category, if one is configured.
  pub fn store_for(&self, category: Category) -> Option<&str> {
    self
      .by_category
      .get(&category)
      .map(|&index| self.specs[index].name.as_str())
  }

  pub fn retention(&self, store: &str) -> Option<chrono::Duration> {
    self
      .specs
      .iter()
      .find(|spec| spec.name == store)
      .map(|spec| spec.retention)
  }

  pub fn storage(&self) -> &Arc<dyn CacheStorage> {
    &self.storage
  }

  fn check(&self, store: &str) -> Result<()> {
    if self.contains(store) {
      Ok(())
    } else {
      Err(eyre!("Unknown cache store: {}", store))
    }
  }

  pub fn get(&self, store: &str, key: &str) -> Result<Option<CacheEntry>> {
    self.check(store)?;
    self.storage.get(store, key)
  }

  pub fn put(&self, store: &str, entry: &CacheEntry) -> Result<()> {
    self.check(store)?;
    self.storage.put(store, entry)
  }

  /// Store `response` only if it has a successful status.
  ///
  /// Returns whether an entry was written.
  pub fn put_if_successful(
    &self,
    store: &str,
    key: &str,
    url: &str,
    response: &ResponseSnapshot,
  ) -> Result<bool> {
    if !response.is_success() {
      debug!(store, url, status = response.status, "Not caching unsuccessful response");
      return Ok(false);
    }

    let entry = CacheEntry::new(key.to_string(), url.to_string(), response.clone());
    self.put(store, &entry)?;
    Ok(true)
  }

  pub fn delete(&self, store: &str, key: &str) -> Result<bool> {
    self.check(store)?;
    self.storage.delete(store, key)
  }

  pub fn delete_all(&self, store: &str) -> Result<usize> {
    self.check(store)?;
    let removed = self.storage.delete_all(store)?;
    info!(store, removed, "Cleared cache store");
    Ok(removed)
  }

  /// Clear every managed store, one store at a time.
  pub fn clear_all(&self) -> Result<usize> {
    let mut removed = 0;
    for name in self.names() {
      removed += self.delete_all(name)?;
    }
    Ok(removed)
  }

  pub fn list_keys(&self, store: &str) -> Result<Vec<String>> {
    self.check(store)?;
    self.storage.list_keys(store)
  }

  pub fn stored_at_index(&self, store: &str) -> Result<Vec<(String, DateTime<Utc>)>> {
    self.check(store)?;
    self.storage.stored_at_index(store)
  }

  pub fn delete_if_stored_before(
    &self,
    store: &str,
    key: &str,
    cutoff: DateTime<Utc>,
  ) -> Result<bool> {
    self.check(store)?;
    self.storage.delete_if_stored_before(store, key, cutoff)
  }

  /// Remove entries of stores that exist in the backend but are no longer
  /// configured. Returns the names of the purged stores.
  pub fn purge_unmanaged(&self) -> Result<Vec<String>> {
    let mut purged = Vec::new();
    for name in self.storage.store_names()? {
      if !self.contains(&name) {
        let removed = self.storage.delete_all(&name)?;
        info!(store = %name, removed, "Purged unmanaged cache store");
        purged.push(name);
      }
    }
    Ok(purged)
  }
}
