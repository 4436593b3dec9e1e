//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::types::{CacheEntry, ResponseSnapshot};
use crate::retry::{DeferredRequest, PendingRetryTask, TaskLog};

/// Trait for cache storage backends.
///
/// Every operation addresses a single store, and at most a single key
/// within it. Writers to the same key are last-writer-wins.
pub trait CacheStorage: Send + Sync {
  /// Get the entry stored under `key`.
  fn get(&self, store: &str, key: &str) -> Result<Option<CacheEntry>>;

  /// Store an entry, replacing any existing entry with the same key.
  fn put(&self, store: &str, entry: &CacheEntry) -> Result<()>;

  /// Remove one entry. Returns whether it existed.
  fn delete(&self, store: &str, key: &str) -> Result<bool>;

  /// Remove every entry of a store. Returns the number removed.
  fn delete_all(&self, store: &str) -> Result<usize>;

  fn list_keys(&self, store: &str) -> Result<Vec<String>>;

  /// Key and storage time of every entry, for age-based eviction.
  fn stored_at_index(&self, store: &str) -> Result<Vec<(String, DateTime<Utc>)>>;

  /// Remove an entry only if it was stored before `cutoff`, so an entry
  /// rewritten after it was scanned survives.
  fn delete_if_stored_before(&self, store: &str, key: &str, cutoff: DateTime<Utc>)
    -> Result<bool>;

  /// Names of all stores that currently hold entries in this backend.
  fn store_names(&self) -> Result<Vec<String>>;

  /// Layer version that last activated against this backend.
  fn recorded_version(&self) -> Result<Option<String>>;

  fn record_version(&self, version: &str) -> Result<()>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn get(&self, _store: &str, _key: &str) -> Result<Option<CacheEntry>> {
    Ok(None) // Always miss
  }

  fn put(&self, _store: &str, _entry: &CacheEntry) -> Result<()> {
    Ok(()) // Discard
  }

  fn delete(&self, _store: &str, _key: &str) -> Result<bool> {
    Ok(false)
  }

  fn delete_all(&self, _store: &str) -> Result<usize> {
    Ok(0)
  }

  fn list_keys(&self, _store: &str) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn stored_at_index(&self, _store: &str) -> Result<Vec<(String, DateTime<Utc>)>> {
    Ok(Vec::new())
  }

  fn delete_if_stored_before(
    &self,
    _store: &str,
    _key: &str,
    _cutoff: DateTime<Utc>,
  ) -> Result<bool> {
    Ok(false)
  }

  fn store_names(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn recorded_version(&self) -> Result<Option<String>> {
    Ok(None)
  }

  fn record_version(&self, _version: &str) -> Result<()> {
    Ok(())
  }
}

/// SQLite-based cache storage implementation.
///
/// Also persists the retry queue, so deferred work survives restarts.
///
/// Calls are synchronous and serialized on one connection. Lookups and
/// writes from the request path therefore block the calling tokio worker
/// for the duration of the query; they are single-row statements on
/// indexed keys. Whole-store scans (eviction) run under `spawn_blocking`.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Create a new SQLite storage at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open (or create) the database at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Database that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("cachegate").join("cache.db"))
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One row per cached response; (store, key) is the identity
CREATE TABLE IF NOT EXISTS cache_entries (
    store TEXT NOT NULL,
    key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at INTEGER NOT NULL,
    PRIMARY KEY (store, key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_stored
    ON cache_entries(store, stored_at);

-- Deferred requests waiting for connectivity, replayed in seq order
CREATE TABLE IF NOT EXISTS retry_queue (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    payload TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS layer_meta (
    name TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

impl CacheStorage for SqliteStorage {
  fn get(&self, store: &str, key: &str) -> Result<Option<CacheEntry>> {
    let conn = self.conn()?;

    let row: Option<(String, u16, String, Vec<u8>, i64)> = conn
      .query_row(
        "SELECT url, status, headers, body, stored_at FROM cache_entries
         WHERE store = ? AND key = ?",
        params![store, key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    match row {
      Some((url, status, headers, body, stored_at)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        Ok(Some(CacheEntry::stored_at(
          key.to_string(),
          url,
          ResponseSnapshot {
            status,
            headers,
            body,
          },
          from_millis(stored_at)?,
        )))
      }
      None => Ok(None),
    }
  }

  fn put(&self, store: &str, entry: &CacheEntry) -> Result<()> {
    let headers = serde_json::to_string(&entry.response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    self
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO cache_entries (store, key, url, status, headers, body, stored_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
          store,
          entry.key,
          entry.url,
          entry.response.status,
          headers,
          entry.response.body,
          entry.stored_at.timestamp_millis()
        ],
      )
      .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    Ok(())
  }

  fn delete(&self, store: &str, key: &str) -> Result<bool> {
    let removed = self
      .conn()?
      .execute(
        "DELETE FROM cache_entries WHERE store = ? AND key = ?",
        params![store, key],
      )
      .map_err(|e| eyre!("Failed to delete cache entry: {}", e))?;

    Ok(removed > 0)
  }

  fn delete_all(&self, store: &str) -> Result<usize> {
    self
      .conn()?
      .execute("DELETE FROM cache_entries WHERE store = ?", params![store])
      .map_err(|e| eyre!("Failed to clear store {}: {}", store, e))
  }

  fn list_keys(&self, store: &str) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT key FROM cache_entries WHERE store = ? ORDER BY stored_at")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![store], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list keys: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read key: {}", e))?;

    Ok(keys)
  }

  fn stored_at_index(&self, store: &str) -> Result<Vec<(String, DateTime<Utc>)>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT key, stored_at FROM cache_entries WHERE store = ?")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![store], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
      })
      .map_err(|e| eyre!("Failed to scan store {}: {}", store, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read entry: {}", e))?;

    rows
      .into_iter()
      .map(|(key, ms)| Ok((key, from_millis(ms)?)))
      .collect()
  }

  fn delete_if_stored_before(
    &self,
    store: &str,
    key: &str,
    cutoff: DateTime<Utc>,
  ) -> Result<bool> {
    let removed = self
      .conn()?
      .execute(
        "DELETE FROM cache_entries WHERE store = ? AND key = ? AND stored_at < ?",
        params![store, key, cutoff.timestamp_millis()],
      )
      .map_err(|e| eyre!("Failed to evict cache entry: {}", e))?;

    Ok(removed > 0)
  }

  fn store_names(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT DISTINCT store FROM cache_entries ORDER BY store")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list stores: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read store name: {}", e))?;

    Ok(names)
  }

  fn recorded_version(&self) -> Result<Option<String>> {
    self
      .conn()?
      .query_row(
        "SELECT value FROM layer_meta WHERE name = 'version'",
        [],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read layer version: {}", e))
  }

  fn record_version(&self, version: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO layer_meta (name, value) VALUES ('version', ?)",
        params![version],
      )
      .map_err(|e| eyre!("Failed to record layer version: {}", e))?;
    Ok(())
  }
}

impl TaskLog for SqliteStorage {
  fn append(&self, task: &PendingRetryTask) -> Result<()> {
    let payload = serde_json::to_string(&task.payload)
      .map_err(|e| eyre!("Failed to serialize deferred request: {}", e))?;

    self
      .conn()?
      .execute(
        "INSERT INTO retry_queue (id, payload, created_at, attempts) VALUES (?, ?, ?, ?)",
        params![
          task.id.to_string(),
          payload,
          task.created_at.timestamp_millis(),
          task.attempts
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue task {}: {}", task.id, e))?;

    Ok(())
  }

  fn pending(&self) -> Result<Vec<PendingRetryTask>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT id, payload, created_at, attempts FROM retry_queue ORDER BY seq")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, i64>(2)?,
          row.get::<_, u32>(3)?,
        ))
      })
      .map_err(|e| eyre!("Failed to read retry queue: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read task: {}", e))?;

    rows
      .into_iter()
      .map(|(id, payload, created_at, attempts)| {
        let id = Uuid::parse_str(&id).map_err(|e| eyre!("Invalid task id '{}': {}", id, e))?;
        let payload: DeferredRequest = serde_json::from_str(&payload)
          .map_err(|e| eyre!("Failed to deserialize task {}: {}", id, e))?;
        Ok(PendingRetryTask {
          id,
          payload,
          created_at: from_millis(created_at)?,
          attempts,
        })
      })
      .collect()
  }

  fn remove(&self, id: Uuid) -> Result<()> {
    self
      .conn()?
      .execute("DELETE FROM retry_queue WHERE id = ?", params![id.to_string()])
      .map_err(|e| eyre!("Failed to remove task {}: {}", id, e))?;
    Ok(())
  }

  fn record_attempt(&self, id: Uuid) -> Result<()> {
    self
      .conn()?
      .execute(
        "UPDATE retry_queue SET attempts = attempts + 1 WHERE id = ?",
        params![id.to_string()],
      )
      .map_err(|e| eyre!("Failed to update task {}: {}", id, e))?;
    Ok(())
  }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
  DateTime::from_timestamp_millis(ms).ok_or_else(|| eyre!("Invalid timestamp: {}", ms))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn entry(key: &str, body: &str, stored_at: DateTime<Utc>) -> CacheEntry {
    CacheEntry::stored_at(
      key.to_string(),
      format!("http://localhost/{}", key),
      ResponseSnapshot::new(200, body).with_header("content-type", "text/css"),
      stored_at,
    )
  }

  #[test]
  fn test_put_get_replace() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let now = Utc::now();

    storage.put("static", &entry("a", "v1", now)).unwrap();
    let got = storage.get("static", "a").unwrap().unwrap();
    assert_eq!(got.response.body, b"v1");
    assert_eq!(got.response.header("content-type"), Some("text/css"));
    assert_eq!(got.stored_at.timestamp_millis(), now.timestamp_millis());

    // Last writer wins
    storage.put("static", &entry("a", "v2", now)).unwrap();
    let got = storage.get("static", "a").unwrap().unwrap();
    assert_eq!(got.response.body, b"v2");
    assert_eq!(storage.list_keys("static").unwrap(), vec!["a".to_string()]);
  }

  #[test]
  fn test_stores_are_independent() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let now = Utc::now();
    storage.put("static", &entry("a", "css", now)).unwrap();
    storage.put("images", &entry("a", "png", now)).unwrap();

    assert_eq!(storage.delete_all("images").unwrap(), 1);
    assert!(storage.get("images", "a").unwrap().is_none());
    assert!(storage.get("static", "a").unwrap().is_some());
    assert_eq!(storage.store_names().unwrap(), vec!["static".to_string()]);
  }

  #[test]
  fn test_delete_if_stored_before() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let now = Utc::now();
    storage
      .put("api", &entry("old", "x", now - chrono::Duration::days(8)))
      .unwrap();
    storage.put("api", &entry("new", "y", now)).unwrap();

    let cutoff = now - chrono::Duration::days(7);
    assert!(storage.delete_if_stored_before("api", "old", cutoff).unwrap());
    assert!(!storage.delete_if_stored_before("api", "new", cutoff).unwrap());
    assert_eq!(storage.stored_at_index("api").unwrap().len(), 1);
  }

  #[test]
  fn test_version_metadata() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    assert_eq!(storage.recorded_version().unwrap(), None);
    storage.record_version("1.0.0").unwrap();
    storage.record_version("1.1.0").unwrap();
    assert_eq!(storage.recorded_version().unwrap(), Some("1.1.0".to_string()));
  }

  #[test]
  fn test_entries_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");

    {
      let storage = SqliteStorage::open_at(&path).unwrap();
      storage.put("pages", &entry("home", "<html>", Utc::now())).unwrap();
    }

    let storage = SqliteStorage::open_at(&path).unwrap();
    assert!(storage.get("pages", "home").unwrap().is_some());
  }

  #[test]
  fn test_noop_storage_always_misses() {
    let storage = NoopStorage;
    storage.put("static", &entry("a", "v", Utc::now())).unwrap();
    assert!(storage.get("static", "a").unwrap().is_none());
    assert!(storage.list_keys("static").unwrap().is_empty());
  }
}
