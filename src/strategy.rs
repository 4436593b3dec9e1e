//! Static mapping from request category to caching strategy.

use serde::Serialize;
use std::fmt;

use crate::classify::Category;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
  /// Serve from the store when present; otherwise fetch and store
  CacheFirst,
  /// Fetch under a time budget; fall back to the store, then offline content
  NetworkFirstWithFallback,
  /// Serve the stored entry now and refresh it in the background
  StaleWhileRevalidate,
  /// Never touch a store
  NetworkOnly,
}

impl Strategy {
  /// The strategy for a category. Fixed: request content beyond the
  /// category never changes the choice.
  pub const fn for_category(category: Category) -> Strategy {
    match category {
      Category::StaticAsset => Strategy::CacheFirst,
      Category::ApiResource => Strategy::NetworkFirstWithFallback,
      Category::Navigation => Strategy::NetworkFirstWithFallback,
      Category::Image => Strategy::StaleWhileRevalidate,
      Category::Sensitive => Strategy::NetworkOnly,
      Category::DynamicOther => Strategy::NetworkFirstWithFallback,
    }
  }

  /// Whether this strategy reads or writes a store.
  pub fn uses_store(&self) -> bool {
    !matches!(self, Strategy::NetworkOnly)
  }
}

impl fmt::Display for Strategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Strategy::CacheFirst => "cache-first",
      Strategy::NetworkFirstWithFallback => "network-first",
      Strategy::StaleWhileRevalidate => "stale-while-revalidate",
      Strategy::NetworkOnly => "network-only",
    };
    f.write_str(name)
  }
}
