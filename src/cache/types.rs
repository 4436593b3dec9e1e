//! Core types for the caching system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of an HTTP response: everything needed to serve it again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl ResponseSnapshot {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  /// A response with a JSON body and matching content type.
  pub fn json(status: u16, value: &serde_json::Value) -> Self {
    Self::new(status, value.to_string()).with_header("content-type", "application/json")
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  /// Only 2xx responses are ever written to a store.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// A stored response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub key: String,
  /// Request URL the entry was produced for
  pub url: String,
  pub response: ResponseSnapshot,
  pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
  /// Create an entry stamped with the current time.
  pub fn new(key: String, url: String, response: ResponseSnapshot) -> Self {
    Self::stored_at(key, url, response, Utc::now())
  }

  pub fn stored_at(
    key: String,
    url: String,
    response: ResponseSnapshot,
    stored_at: DateTime<Utc>,
  ) -> Self {
    Self {
      key,
      url,
      response,
      stored_at,
    }
  }

  pub fn age_at(&self, now: DateTime<Utc>) -> chrono::Duration {
    now - self.stored_at
  }
}

/// Result of running a request through a strategy, including where the
/// response came from.
#[derive(Debug, Clone)]
pub struct Served {
  /// The actual response
  pub response: ResponseSnapshot,
  /// Where the response came from
  pub source: CacheSource,
  /// When the response was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl Served {
  /// Fresh response straight from the network.
  pub fn from_network(response: ResponseSnapshot) -> Self {
    Self {
      response,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Cached response served without consulting the network.
  pub fn from_cache(entry: CacheEntry) -> Self {
    Self {
      response: entry.response,
      source: CacheSource::CacheFresh,
      cached_at: Some(entry.stored_at),
    }
  }

  /// Cached response served while a background refresh is in flight.
  pub fn stale(entry: CacheEntry) -> Self {
    Self {
      response: entry.response,
      source: CacheSource::CacheStale,
      cached_at: Some(entry.stored_at),
    }
  }

  /// Cached response served because the network failed or timed out.
  pub fn offline(entry: CacheEntry) -> Self {
    Self {
      response: entry.response,
      source: CacheSource::Offline,
      cached_at: Some(entry.stored_at),
    }
  }

  /// Generated response: neither network nor cache could answer.
  pub fn fallback(response: ResponseSnapshot) -> Self {
    Self {
      response,
      source: CacheSource::Fallback,
      cached_at: None,
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, no network involved
  CacheFresh,
  /// Data from cache while a revalidation runs in the background
  CacheStale,
  /// Offline mode - network unavailable, serving cached data
  Offline,
  /// Offline mode with nothing cached - generated placeholder
  Fallback,
}

impl CacheSource {
  /// Whether the response was read from a store.
  pub fn is_cached(&self) -> bool {
    matches!(
      self,
      CacheSource::CacheFresh | CacheSource::CacheStale | CacheSource::Offline
    )
  }
}
