//! In-process counters for the request path.
//!
//! Every request that goes through a strategy records exactly one terminal
//! outcome: a hit or a miss (cacheable categories only), plus a network
//! request or an offline response when the cache alone did not answer.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::cache::CacheSource;
use crate::classify::Category;

#[derive(Debug, Default)]
struct Counters {
  hits: AtomicU64,
  misses: AtomicU64,
  network_requests: AtomicU64,
  offline_responses: AtomicU64,
}

impl Counters {
  fn counts(&self) -> Counts {
    Counts {
      hits: self.hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
      network_requests: self.network_requests.load(Ordering::Relaxed),
      offline_responses: self.offline_responses.load(Ordering::Relaxed),
    }
  }
}

#[derive(Debug, Default)]
pub struct Metrics {
  total: Counters,
  by_category: [Counters; 6],
}

impl Metrics {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn record_hit(&self, category: Category) {
    self.total.hits.fetch_add(1, Ordering::Relaxed);
    self.by_category[category.index()]
      .hits
      .fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_miss(&self, category: Category) {
    self.total.misses.fetch_add(1, Ordering::Relaxed);
    self.by_category[category.index()]
      .misses
      .fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_network_request(&self, category: Category) {
    self.total.network_requests.fetch_add(1, Ordering::Relaxed);
    self.by_category[category.index()]
      .network_requests
      .fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_offline_response(&self, category: Category) {
    self.total.offline_responses.fetch_add(1, Ordering::Relaxed);
    self.by_category[category.index()]
      .offline_responses
      .fetch_add(1, Ordering::Relaxed);
  }

  /// Record the terminal outcome of one request.
  pub fn record_served(&self, category: Category, source: CacheSource) {
    let cacheable = category != Category::Sensitive;

    match source {
      CacheSource::CacheFresh | CacheSource::CacheStale => self.record_hit(category),
      CacheSource::Offline => {
        self.record_hit(category);
        self.record_offline_response(category);
      }
      CacheSource::Network => {
        if cacheable {
          self.record_miss(category);
        }
        self.record_network_request(category);
      }
      CacheSource::Fallback => {
        if cacheable {
          self.record_miss(category);
        }
        self.record_offline_response(category);
      }
    }
  }

  pub fn snapshot(&self) -> MetricsSnapshot {
    let total = self.total.counts();
    let by_category = Category::ALL
      .iter()
      .map(|category| (*category, self.by_category[category.index()].counts()))
      .filter(|(_, counts)| !counts.is_empty())
      .collect();

    MetricsSnapshot {
      hits: total.hits,
      misses: total.misses,
      network_requests: total.network_requests,
      offline_responses: total.offline_responses,
      by_category,
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
  pub hits: u64,
  pub misses: u64,
  pub network_requests: u64,
  pub offline_responses: u64,
}

impl Counts {
  fn is_empty(&self) -> bool {
    self.hits + self.misses + self.network_requests + self.offline_responses == 0
  }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
  pub hits: u64,
  pub misses: u64,
  pub network_requests: u64,
  pub offline_responses: u64,
  pub by_category: BTreeMap<Category, Counts>,
}

impl MetricsSnapshot {
  /// Cache hit rate as a percentage
  pub fn hit_rate(&self) -> f64 {
    let total = self.hits + self.misses;
    if total == 0 {
      0.0
    } else {
      (self.hits as f64 / total as f64) * 100.0
    }
  }
}

impl fmt::Display for MetricsSnapshot {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "hits: {}, misses: {}, hit_rate: {:.2}%, network: {}, offline: {}",
      self.hits,
      self.misses,
      self.hit_rate(),
      self.network_requests,
      self.offline_responses
    )
  }
}
