//! Cache key derivation.

use sha2::{Digest, Sha256};

use crate::request::RequestDescriptor;

/// Derive the cache key for a request.
///
/// The key covers the method and the URL without its fragment, so the same
/// request shape always maps to the same entry.
pub fn cache_key(request: &RequestDescriptor) -> String {
  let mut url = request.url.clone();
  url.set_fragment(None);
  let input = format!("{} {}", request.method.as_str(), url.as_str());

  // SHA256 hash for stable, fixed-length keys
  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  let result = hasher.finalize();
  hex::encode(result)
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::Method;
  use url::Url;

  fn request(method: Method, url: &str) -> RequestDescriptor {
    RequestDescriptor::new(method, Url::parse(url).unwrap())
  }

  #[test]
  fn test_key_is_stable() {
    let a = cache_key(&request(Method::GET, "http://localhost/static/app.css"));
    let b = cache_key(&request(Method::GET, "http://localhost/static/app.css"));
    assert_eq!(a, b);
    assert_eq!(a.len(), 64);
  }

  #[test]
  fn test_fragment_and_host_case_ignored() {
    let a = cache_key(&request(Method::GET, "http://LOCALHOST/page#section"));
    let b = cache_key(&request(Method::GET, "http://localhost/page"));
    assert_eq!(a, b);
  }

  #[test]
  fn test_method_and_query_distinguish() {
    let get = cache_key(&request(Method::GET, "http://localhost/api/items?page=1"));
    let head = cache_key(&request(Method::HEAD, "http://localhost/api/items?page=1"));
    let page2 = cache_key(&request(Method::GET, "http://localhost/api/items?page=2"));
    assert_ne!(get, head);
    assert_ne!(get, page2);
  }
}
