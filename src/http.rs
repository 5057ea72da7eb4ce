//! Request/response value types and the network fetcher abstraction.
//!
//! The worker never touches reqwest directly; everything goes through the
//! [`Fetcher`] trait so tests can script network behavior.

use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::future::Future;
use url::Url;

/// HTTP method of an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
  Get,
  Post,
  Put,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Delete => "DELETE",
    }
  }

  /// Whether this method carries a side effect worth deferring when offline.
  pub fn is_mutating(&self) -> bool {
    !matches!(self, Method::Get)
  }
}

impl std::fmt::Display for Method {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// What kind of resource a request is for, as reported by the host runtime.
///
/// Mirrors the subset of fetch destinations the router cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
  /// Top-level navigation / HTML
  Document,
  Style,
  Script,
  Font,
  Image,
  /// Anything else (XHR/fetch, media, workers, ...)
  Other,
}

/// An intercepted outgoing request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub destination: Destination,
  pub headers: BTreeMap<String, String>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  /// A plain GET request with no particular destination.
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::Get,
      url,
      destination: Destination::Other,
      headers: BTreeMap::new(),
      body: None,
    }
  }

  /// A POST request carrying a body.
  pub fn post(url: Url, body: Vec<u8>) -> Self {
    Self {
      method: Method::Post,
      url,
      destination: Destination::Other,
      headers: BTreeMap::new(),
      body: Some(body),
    }
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }
}

/// A captured or synthesized response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: Vec<u8>) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body,
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_string(), value.to_string());
    self
  }

  /// True for 2xx statuses.
  pub fn ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Synthetic 503 with a human-readable unavailability message.
  pub fn service_unavailable(message: &str) -> Self {
    Response::new(503, message.as_bytes().to_vec()).with_header("content-type", "text/plain")
  }

  /// Synthetic 202 acknowledging a mutation deferred to the sync queue.
  pub fn accepted_for_sync(task_id: &str) -> Self {
    let body = format!(r#"{{"status":"queued","id":"{}"}}"#, task_id);
    Response::new(202, body.into_bytes()).with_header("content-type", "application/json")
  }
}

/// Network access used by the caching strategies and the sync queue replayer.
pub trait Fetcher: Send + Sync {
  /// Perform the request against the real network.
  ///
  /// Errors represent transport failure (offline, DNS, reset); an HTTP error
  /// status is a successful fetch and comes back as a `Response`.
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send;
}

/// Production fetcher backed by a shared reqwest client.
#[derive(Clone)]
pub struct ReqwestFetcher {
  client: reqwest::Client,
}

impl ReqwestFetcher {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;
    Ok(Self { client })
  }
}

impl Fetcher for ReqwestFetcher {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send {
    let client = self.client.clone();
    let request = request.clone();

    async move {
      let mut builder = match request.method {
        Method::Get => client.get(request.url.clone()),
        Method::Post => client.post(request.url.clone()),
        Method::Put => client.put(request.url.clone()),
        Method::Delete => client.delete(request.url.clone()),
      };

      for (name, value) in &request.headers {
        builder = builder.header(name, value);
      }
      if let Some(body) = request.body.clone() {
        builder = builder.body(body);
      }

      let response = builder
        .send()
        .await
        .map_err(|e| eyre!("Network error for {}: {}", request.url, e))?;

      let status = response.status().as_u16();
      let mut headers = BTreeMap::new();
      for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
          headers.insert(name.to_string(), value.to_string());
        }
      }
      let body = response
        .bytes()
        .await
        .map_err(|e| eyre!("Failed to read response body from {}: {}", request.url, e))?
        .to_vec();

      Ok(Response {
        status,
        headers,
        body,
      })
    }
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_response_ok_range() {
    assert!(Response::new(200, vec![]).ok());
    assert!(Response::new(204, vec![]).ok());
    assert!(!Response::new(304, vec![]).ok());
    assert!(!Response::new(404, vec![]).ok());
    assert!(!Response::new(503, vec![]).ok());
  }

  #[test]
  fn test_service_unavailable_shape() {
    let response = Response::service_unavailable("Connection required");
    assert_eq!(response.status, 503);
    assert_eq!(response.body, b"Connection required");
    assert_eq!(
      response.headers.get("content-type").map(String::as_str),
      Some("text/plain")
    );
  }

  #[test]
  fn test_mutating_methods() {
    assert!(!Method::Get.is_mutating());
    assert!(Method::Post.is_mutating());
    assert!(Method::Put.is_mutating());
    assert!(Method::Delete.is_mutating());
  }
}
