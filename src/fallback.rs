//! Responses generated when neither the network nor a store can answer.

use serde_json::json;

use crate::cache::ResponseSnapshot;
use crate::classify::Category;

const OFFLINE_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Offline</title>
</head>
<body>
  <h1>You are offline</h1>
  <p>This page is not available without a connection. It will load again once you are back online.</p>
</body>
</html>
"#;

const PLACEHOLDER_IMAGE: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="400" height="300" viewBox="0 0 400 300"><rect width="400" height="300" fill="#e5e7eb"/><text x="200" y="155" font-family="sans-serif" font-size="18" fill="#6b7280" text-anchor="middle">Image unavailable offline</text></svg>"##;

#[derive(Debug, Clone)]
pub struct OfflineResponses {
  page: String,
}

impl Default for OfflineResponses {
  fn default() -> Self {
    Self {
      page: OFFLINE_PAGE.to_string(),
    }
  }
}

impl OfflineResponses {
  /// Use a custom offline document for navigations.
  pub fn with_page(page: String) -> Self {
    Self { page }
  }

  pub fn for_category(&self, category: Category) -> ResponseSnapshot {
    match category {
      Category::Navigation => self.page(),
      Category::Image => Self::placeholder_image(),
      _ => Self::offline_error(),
    }
  }

  /// The designated offline document.
  pub fn page(&self) -> ResponseSnapshot {
    ResponseSnapshot::new(200, self.page.clone())
      .with_header("content-type", "text/html; charset=utf-8")
      .with_header("cache-control", "no-store")
  }

  pub fn placeholder_image() -> ResponseSnapshot {
    ResponseSnapshot::new(200, PLACEHOLDER_IMAGE)
      .with_header("content-type", "image/svg+xml")
      .with_header("cache-control", "no-store")
  }

  /// Structured `{"error": "offline"}` object.
  pub fn offline_error() -> ResponseSnapshot {
    ResponseSnapshot::json(503, &json!({ "error": "offline" }))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_fallback_per_category() {
    let fallbacks = OfflineResponses::default();

    let page = fallbacks.for_category(Category::Navigation);
    assert!(page.header("content-type").unwrap().starts_with("text/html"));
    assert!(String::from_utf8_lossy(&page.body).contains("offline"));

    let image = fallbacks.for_category(Category::Image);
    assert_eq!(image.header("content-type"), Some("image/svg+xml"));

    let api = fallbacks.for_category(Category::ApiResource);
    assert_eq!(api.status, 503);
    let body: serde_json::Value = serde_json::from_slice(&api.body).unwrap();
    assert_eq!(body, json!({ "error": "offline" }));
  }

  #[test]
  fn test_custom_page() {
    let fallbacks = OfflineResponses::with_page("<p>down</p>".to_string());
    assert_eq!(fallbacks.for_category(Category::Navigation).body, b"<p>down</p>");
  }
}
