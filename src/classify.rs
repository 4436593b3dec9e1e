//! Request classification.
//!
//! Maps every request to exactly one [`Category`]. The classifier holds only
//! its immutable rule lists, so the same request shape always lands in the
//! same category.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::config::ClassifierConfig;
use crate::request::RequestDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
  /// Script, style and font bundles
  StaticAsset,
  ApiResource,
  Image,
  /// Top-level document loads
  Navigation,
  /// Auth, payment, admin and destructive endpoints; never cached
  Sensitive,
  DynamicOther,
}

impl Category {
  pub const ALL: [Category; 6] = [
    Category::StaticAsset,
    Category::ApiResource,
    Category::Image,
    Category::Navigation,
    Category::Sensitive,
    Category::DynamicOther,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Category::StaticAsset => "static_asset",
      Category::ApiResource => "api_resource",
      Category::Image => "image",
      Category::Navigation => "navigation",
      Category::Sensitive => "sensitive",
      Category::DynamicOther => "dynamic_other",
    }
  }

  pub(crate) fn index(&self) -> usize {
    *self as usize
  }
}

impl fmt::Display for Category {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone)]
pub struct Classifier {
  sensitive_prefixes: Vec<String>,
  api_prefixes: Vec<String>,
  static_extensions: HashSet<String>,
  image_extensions: HashSet<String>,
}

impl Default for Classifier {
  fn default() -> Self {
    Self::new(&ClassifierConfig::default())
  }
}

impl Classifier {
  pub fn new(config: &ClassifierConfig) -> Self {
    let lower = |items: &[String]| items.iter().map(|s| s.to_lowercase()).collect();
    Self {
      sensitive_prefixes: lower(&config.sensitive_prefixes),
      api_prefixes: lower(&config.api_prefixes),
      static_extensions: config
        .static_extensions
        .iter()
        .map(|e| e.trim_start_matches('.').to_lowercase())
        .collect(),
      image_extensions: config
        .image_extensions
        .iter()
        .map(|e| e.trim_start_matches('.').to_lowercase())
        .collect(),
    }
  }

  /// Classify a request. Total: anything unrecognised is `DynamicOther`.
  ///
  /// Unsafe methods come back as `Sensitive`; callers are expected to have
  /// bypassed the layer for them already.
  pub fn classify(&self, request: &RequestDescriptor) -> Category {
    if !request.is_safe() {
      return Category::Sensitive;
    }

    let path = request.path().to_lowercase();

    // Sensitive wins over every other match
    if self
      .sensitive_prefixes
      .iter()
      .any(|prefix| matches_prefix(&path, prefix))
    {
      return Category::Sensitive;
    }

    if let Some(ext) = extension(&path) {
      if self.static_extensions.contains(ext) {
        return Category::StaticAsset;
      }
      if self.image_extensions.contains(ext) {
        return Category::Image;
      }
    }

    if self
      .api_prefixes
      .iter()
      .any(|prefix| matches_prefix(&path, prefix))
    {
      return Category::ApiResource;
    }

    if is_navigation(request) {
      return Category::Navigation;
    }

    Category::DynamicOther
  }
}

/// Segment-aware prefix match: `/admin` matches `/admin` and `/admin/users`
/// but not `/administrator`.
fn matches_prefix(path: &str, prefix: &str) -> bool {
  if prefix.is_empty() || !path.starts_with(prefix) {
    return false;
  }
  prefix.ends_with('/') || path.len() == prefix.len() || path[prefix.len()..].starts_with('/')
}

fn extension(path: &str) -> Option<&str> {
  let segment = path.rsplit('/').next()?;
  let (stem, ext) = segment.rsplit_once('.')?;
  if stem.is_empty() || ext.is_empty() {
    return None;
  }
  Some(ext)
}

fn is_navigation(request: &RequestDescriptor) -> bool {
  if request.header("sec-fetch-mode") == Some("navigate") {
    return true;
  }
  if request.header("sec-fetch-dest") == Some("document") {
    return true;
  }
  request
    .header("accept")
    .map(|accept| accept.contains("text/html"))
    .unwrap_or(false)
}
