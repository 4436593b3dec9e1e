//! Request descriptors: the part of an outbound request the layer needs to
//! classify it, key it, and replay it.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use reqwest::Method;
use tracing::warn;
use url::Url;

#[derive(Debug, Clone)]
pub struct RequestDescriptor {
  pub method: Method,
  pub url: Url,
  pub headers: HeaderMap,
  /// Only carried for pass-through requests; reads never have a body.
  pub body: Vec<u8>,
}

impl RequestDescriptor {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: HeaderMap::new(),
      body: Vec::new(),
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// A GET carrying the signals a browser sends for a top-level document load.
  pub fn navigate(url: Url) -> Self {
    Self::get(url)
      .with_header(ACCEPT, HeaderValue::from_static("text/html,application/xhtml+xml"))
      .with_header(
        HeaderName::from_static("sec-fetch-mode"),
        HeaderValue::from_static("navigate"),
      )
  }

  pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
    self.headers.insert(name, value);
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = body.into();
    self
  }

  /// Safe, idempotent reads are the only requests eligible for caching.
  pub fn is_safe(&self) -> bool {
    self.method == Method::GET || self.method == Method::HEAD
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(name).and_then(|v| v.to_str().ok())
  }

  pub fn path(&self) -> &str {
    self.url.path()
  }
}

/// Header pairs as text. A value that is not valid UTF-8 cannot be kept in
/// a snapshot and is dropped with a warning.
pub fn text_headers(headers: &HeaderMap) -> Vec<(String, String)> {
  headers
    .iter()
    .filter_map(|(name, value)| match value.to_str() {
      Ok(text) => Some((name.as_str().to_string(), text.to_string())),
      Err(_) => {
        warn!(header = %name, bytes = value.len(), "Dropping header with non-UTF-8 value");
        None
      }
    })
    .collect()
}

/// Resolve an absolute URL or a path relative to `origin`.
pub fn resolve_url(origin: &Url, input: &str) -> Result<Url, url::ParseError> {
  match Url::parse(input) {
    Ok(url) => Ok(url),
    Err(url::ParseError::RelativeUrlWithoutBase) => origin.join(input),
    Err(e) => Err(e),
  }
}
