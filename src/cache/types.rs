//! Key and entry types for the cache store.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::http::{Method, Request, Response};

/// Canonical identity of a cacheable request: method + normalized URL.
///
/// Normalization strips the fragment; the query string is significant and
/// kept. Lookup is exact, no prefix or partial matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestKey {
  method: String,
  url: String,
}

impl RequestKey {
  pub fn new(method: Method, url: &url::Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method: method.as_str().to_string(),
      url: url.to_string(),
    }
  }

  pub fn for_request(request: &Request) -> Self {
    Self::new(request.method, &request.url)
  }

  /// Build a key from raw parts, for internal resources that are not real
  /// network URLs (e.g. the user-data snapshot).
  pub fn from_parts(method: &str, url: &str) -> Self {
    Self {
      method: method.to_string(),
      url: url.to_string(),
    }
  }

  /// Human-readable form, used in logs and as the in-memory map key.
  pub fn canonical(&self) -> String {
    format!("{} {}", self.method, self.url)
  }

  /// SHA256 hash of the canonical form, for stable fixed-length storage keys.
  pub fn storage_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.canonical().as_bytes());
    hex::encode(hasher.finalize())
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &str {
    &self.url
  }
}

/// A captured response as stored in a namespace.
///
/// The body is immutable once stored; a refresh overwrites the whole entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
  pub cached_at: DateTime<Utc>,
}

impl CachedResponse {
  /// Capture a copy of a live response for storage.
  pub fn capture(response: &Response) -> Self {
    Self {
      status: response.status,
      headers: response.headers.clone(),
      body: response.body.clone(),
      cached_at: Utc::now(),
    }
  }

  /// Rehydrate into a servable response.
  pub fn into_response(self) -> Response {
    Response {
      status: self.status,
      headers: self.headers,
      body: self.body,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_key_strips_fragment() {
    let a = url::Url::parse("https://app.local/log#section").unwrap();
    let b = url::Url::parse("https://app.local/log").unwrap();
    assert_eq!(
      RequestKey::new(Method::Get, &a),
      RequestKey::new(Method::Get, &b)
    );
  }

  #[test]
  fn test_key_keeps_query() {
    let a = url::Url::parse("https://app.local/foods?q=oats").unwrap();
    let b = url::Url::parse("https://app.local/foods?q=rice").unwrap();
    assert_ne!(
      RequestKey::new(Method::Get, &a),
      RequestKey::new(Method::Get, &b)
    );
  }

  #[test]
  fn test_key_distinguishes_methods() {
    let url = url::Url::parse("https://app.local/weight").unwrap();
    assert_ne!(
      RequestKey::new(Method::Get, &url),
      RequestKey::new(Method::Post, &url)
    );
  }

  #[test]
  fn test_storage_hash_is_stable_hex() {
    let url = url::Url::parse("https://app.local/").unwrap();
    let key = RequestKey::new(Method::Get, &url);
    let hash = key.storage_hash();
    assert_eq!(hash.len(), 64);
    assert_eq!(hash, key.storage_hash());
  }

  #[test]
  fn test_capture_round_trip() {
    let response = Response::new(200, b"abc".to_vec()).with_header("content-type", "text/css");
    let captured = CachedResponse::capture(&response);
    assert_eq!(captured.into_response(), response);
  }
}
