//! In-process storage backend.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use dashmap::DashMap;
use std::sync::Mutex;

use super::storage::CacheStorage;
use super::types::CacheEntry;

/// Stores live for the lifetime of the process.
///
/// Each store is its own sharded map, so writers only contend on the shard
/// holding their key and never across stores.
#[derive(Default)]
pub struct MemoryStorage {
  stores: DashMap<String, DashMap<String, CacheEntry>>,
  version: Mutex<Option<String>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

impl CacheStorage for MemoryStorage {
  fn get(&self, store: &str, key: &str) -> Result<Option<CacheEntry>> {
    Ok(
      self
        .stores
        .get(store)
        .and_then(|entries| entries.get(key).map(|e| e.value().clone())),
    )
  }

  fn put(&self, store: &str, entry: &CacheEntry) -> Result<()> {
    self
      .stores
      .entry(store.to_string())
      .or_default()
      .insert(entry.key.clone(), entry.clone());
    Ok(())
  }

  fn delete(&self, store: &str, key: &str) -> Result<bool> {
    Ok(
      self
        .stores
        .get(store)
        .map(|entries| entries.remove(key).is_some())
        .unwrap_or(false),
    )
  }

  fn delete_all(&self, store: &str) -> Result<usize> {
    Ok(
      self
        .stores
        .get(store)
        .map(|entries| {
          let count = entries.len();
          entries.clear();
          count
        })
        .unwrap_or(0),
    )
  }

  fn list_keys(&self, store: &str) -> Result<Vec<String>> {
    Ok(
      self
        .stores
        .get(store)
        .map(|entries| entries.iter().map(|e| e.key().clone()).collect())
        .unwrap_or_default(),
    )
  }

  fn stored_at_index(&self, store: &str) -> Result<Vec<(String, DateTime<Utc>)>> {
    Ok(
      self
        .stores
        .get(store)
        .map(|entries| {
          entries
            .iter()
            .map(|e| (e.key().clone(), e.value().stored_at))
            .collect()
        })
        .unwrap_or_default(),
    )
  }

  fn delete_if_stored_before(
    &self,
    store: &str,
    key: &str,
    cutoff: DateTime<Utc>,
  ) -> Result<bool> {
    Ok(
      self
        .stores
        .get(store)
        .map(|entries| {
          entries
            .remove_if(key, |_, entry| entry.stored_at < cutoff)
            .is_some()
        })
        .unwrap_or(false),
    )
  }

  fn store_names(&self) -> Result<Vec<String>> {
    let mut names: Vec<String> = self
      .stores
      .iter()
      .filter(|store| !store.value().is_empty())
      .map(|store| store.key().clone())
      .collect();
    names.sort();
    Ok(names)
  }

  fn recorded_version(&self) -> Result<Option<String>> {
    let version = self
      .version
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(version.clone())
  }

  fn record_version(&self, version: &str) -> Result<()> {
    let mut current = self
      .version
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    *current = Some(version.to_string());
    Ok(())
  }
}
