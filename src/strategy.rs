//! The four caching strategies.
//!
//! Every strategy resolves to a `Response` on every branch; nothing in here
//! may surface an error to the request pipeline, because an unhandled failure
//! there breaks the page load entirely. Cache read failures degrade to a
//! miss, cache write failures are best-effort and only logged.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{CacheStore, CachedResponse, RequestKey};
use crate::http::{Fetcher, Request, Response};

/// Fixed page served for navigations that fail with no cache hit. Bundled at
/// build time; never regenerated at runtime.
pub const OFFLINE_FALLBACK_HTML: &str = include_str!("offline.html");

/// Builds the offline fallback navigation response: always status 200 so a
/// navigation never hard-fails into the browser's own error page.
pub fn offline_fallback() -> Response {
  Response::new(200, OFFLINE_FALLBACK_HTML.as_bytes().to_vec())
    .with_header("content-type", "text/html; charset=utf-8")
}

/// Executes caching strategies against a store and a fetcher.
pub struct StrategyRunner<S, F> {
  store: Arc<S>,
  fetcher: Arc<F>,
  static_namespace: String,
  dynamic_namespace: String,
}

impl<S, F> StrategyRunner<S, F>
where
  S: CacheStore + 'static,
  F: Fetcher + 'static,
{
  pub fn new(
    store: Arc<S>,
    fetcher: Arc<F>,
    static_namespace: String,
    dynamic_namespace: String,
  ) -> Self {
    Self {
      store,
      fetcher,
      static_namespace,
      dynamic_namespace,
    }
  }

  /// Cache-first, for static assets.
  ///
  /// A hit is returned with no network call and no freshness check: static
  /// assets are versioned by URL, so a hit is always valid. A miss fetches
  /// and stores; network failure yields a synthetic 503.
  pub async fn cache_first(&self, request: &Request) -> Response {
    let key = RequestKey::for_request(request);

    if let Some(cached) = self.cached(&self.static_namespace, &key) {
      return cached.into_response();
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.ok() {
          self.store_copy(&self.static_namespace, &key, &response);
        }
        response
      }
      Err(e) => {
        debug!("cache-first miss and network failed for {}: {}", request.url, e);
        Response::service_unavailable("Resource unavailable offline")
      }
    }
  }

  /// Network-first, for cross-origin and uncategorized requests.
  ///
  /// Live responses win; only 2xx responses are stored. On network failure a
  /// stale copy from the dynamic namespace is acceptable.
  pub async fn network_first(&self, request: &Request) -> Response {
    let key = RequestKey::for_request(request);

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.ok() {
          self.store_copy(&self.dynamic_namespace, &key, &response);
        }
        response
      }
      Err(e) => {
        debug!("network-first falling back to cache for {}: {}", request.url, e);
        match self.cached(&self.dynamic_namespace, &key) {
          Some(cached) => cached.into_response(),
          None => Response::service_unavailable("Connection required"),
        }
      }
    }
  }

  /// Network-first with offline fallback, for document navigations.
  ///
  /// Unlike generic network-first, ANY response is cached and returned
  /// regardless of status, so a server's own error page is still available
  /// offline. With no network and no cache hit, the fixed offline document
  /// is served instead of an error.
  pub async fn network_first_with_fallback(&self, request: &Request) -> Response {
    let key = RequestKey::for_request(request);

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        self.store_copy(&self.dynamic_namespace, &key, &response);
        response
      }
      Err(e) => {
        debug!("navigation fetch failed for {}: {}", request.url, e);
        match self.cached(&self.dynamic_namespace, &key) {
          Some(cached) => cached.into_response(),
          None => offline_fallback(),
        }
      }
    }
  }

  /// Stale-while-revalidate.
  ///
  /// A hit is returned immediately while a detached refresh overwrites the
  /// entry for the next request; the refresh is never awaited on the hot
  /// path and its errors are only logged. A miss awaits the network.
  pub async fn stale_while_revalidate(&self, request: &Request) -> Response {
    let key = RequestKey::for_request(request);

    if let Some(cached) = self.cached(&self.dynamic_namespace, &key) {
      self.spawn_revalidate(request.clone(), key);
      return cached.into_response();
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.ok() {
          self.store_copy(&self.dynamic_namespace, &key, &response);
        }
        response
      }
      Err(e) => {
        debug!("revalidate miss and network failed for {}: {}", request.url, e);
        Response::service_unavailable("Connection required")
      }
    }
  }

  /// Detached background refresh; observed only by the next cache read.
  fn spawn_revalidate(&self, request: Request, key: RequestKey) {
    let store = Arc::clone(&self.store);
    let fetcher = Arc::clone(&self.fetcher);
    let namespace = self.dynamic_namespace.clone();

    tokio::spawn(async move {
      match fetcher.fetch(&request).await {
        Ok(response) if response.ok() => {
          if let Err(e) = store.put(&namespace, &key, &CachedResponse::capture(&response)) {
            warn!("background refresh store failed for {}: {}", key.canonical(), e);
          }
        }
        Ok(response) => {
          debug!(
            "background refresh for {} returned {}, keeping stale entry",
            key.canonical(),
            response.status
          );
        }
        Err(e) => {
          debug!("background refresh failed for {}: {}", key.canonical(), e);
        }
      }
    });
  }

  /// Read through the store, degrading any I/O failure to a miss.
  fn cached(&self, namespace: &str, key: &RequestKey) -> Option<CachedResponse> {
    match self.store.lookup(namespace, key) {
      Ok(found) => found,
      Err(e) => {
        warn!("cache read failed for {}: {}", key.canonical(), e);
        None
      }
    }
  }

  /// Best-effort write; failures are logged and ignored.
  fn store_copy(&self, namespace: &str, key: &RequestKey, response: &Response) {
    if let Err(e) = self
      .store
      .put(namespace, key, &CachedResponse::capture(response))
    {
      warn!("cache write failed for {}: {}", key.canonical(), e);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStore;
  use crate::http::testing::MockFetcher;
  use std::time::Duration;

  const STATIC_NS: &str = "static-v1";
  const DYNAMIC_NS: &str = "dynamic-v1";

  fn runner(fetcher: Arc<MockFetcher>) -> StrategyRunner<MemoryStore, MockFetcher> {
    StrategyRunner::new(
      Arc::new(MemoryStore::new()),
      fetcher,
      STATIC_NS.to_string(),
      DYNAMIC_NS.to_string(),
    )
  }

  fn get(url: &str) -> Request {
    Request::get(url::Url::parse(url).unwrap())
  }

  #[tokio::test]
  async fn test_cache_first_hit_skips_network() {
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.push_ok(Response::new(200, b"body{}".to_vec()));
    let runner = runner(Arc::clone(&fetcher));
    let request = get("https://app.local/styles/main.css");

    // First request populates the cache.
    let first = runner.cache_first(&request).await;
    assert_eq!(first.body, b"body{}");
    assert_eq!(fetcher.calls(), 1);

    // Repeat requests never hit the network again.
    for _ in 0..3 {
      let repeat = runner.cache_first(&request).await;
      assert_eq!(repeat.body, b"body{}");
    }
    assert_eq!(fetcher.calls(), 1);
  }

  #[tokio::test]
  async fn test_cache_first_miss_offline_is_503() {
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.push_err();
    let runner = runner(fetcher);

    let response = runner.cache_first(&get("https://app.local/icons/x.png")).await;
    assert_eq!(response.status, 503);
  }

  #[tokio::test]
  async fn test_network_first_prefers_live_response() {
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.push_ok(Response::new(200, b"old".to_vec()));
    fetcher.push_ok(Response::new(200, b"new".to_vec()));
    let runner = runner(Arc::clone(&fetcher));
    let request = get("https://app.local/api/meals");

    assert_eq!(runner.network_first(&request).await.body, b"old");
    assert_eq!(runner.network_first(&request).await.body, b"new");
    assert_eq!(fetcher.calls(), 2);
  }

  #[tokio::test]
  async fn test_network_first_falls_back_to_stale_copy() {
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.push_ok(Response::new(200, b"cached".to_vec()));
    fetcher.push_err();
    let runner = runner(fetcher);
    let request = get("https://app.local/api/meals");

    runner.network_first(&request).await;
    let offline = runner.network_first(&request).await;
    assert_eq!(offline.body, b"cached");
  }

  #[tokio::test]
  async fn test_network_first_does_not_store_error_responses() {
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.push_ok(Response::new(500, b"boom".to_vec()));
    fetcher.push_err();
    let runner = runner(fetcher);
    let request = get("https://app.local/api/meals");

    assert_eq!(runner.network_first(&request).await.status, 500);
    // The 500 was not cached, so offline yields the synthetic 503.
    assert_eq!(runner.network_first(&request).await.status, 503);
  }

  #[tokio::test]
  async fn test_document_strategy_caches_any_status() {
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.push_ok(Response::new(404, b"not found page".to_vec()));
    fetcher.push_err();
    let runner = runner(fetcher);
    let request = get("https://app.local/missing");

    // The server's own 404 page is cached and replayed offline.
    assert_eq!(runner.network_first_with_fallback(&request).await.status, 404);
    let offline = runner.network_first_with_fallback(&request).await;
    assert_eq!(offline.status, 404);
    assert_eq!(offline.body, b"not found page");
  }

  #[tokio::test]
  async fn test_document_offline_uncached_serves_fallback() {
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.push_err();
    let runner = runner(fetcher);

    let response = runner
      .network_first_with_fallback(&get("https://app.local/index.html"))
      .await;
    assert_eq!(response.status, 200);
    let body = String::from_utf8_lossy(&response.body);
    assert!(body.contains("FitSync is offline"));
  }

  #[tokio::test]
  async fn test_swr_miss_waits_for_network() {
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.push_ok(Response::new(200, b"fresh".to_vec()));
    let runner = runner(fetcher);

    let response = runner
      .stale_while_revalidate(&get("https://app.local/api/foods"))
      .await;
    assert_eq!(response.body, b"fresh");
  }

  #[tokio::test]
  async fn test_swr_converges_to_fresh_value() {
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.push_ok(Response::new(200, b"gen1".to_vec()));
    fetcher.push_ok(Response::new(200, b"gen2".to_vec()));
    let runner = runner(Arc::clone(&fetcher));
    let request = get("https://app.local/api/foods");

    // Populate, then request again: the stale value is served while the
    // detached refresh overwrites the entry.
    runner.stale_while_revalidate(&request).await;
    let stale = runner.stale_while_revalidate(&request).await;
    assert_eq!(stale.body, b"gen1");

    // Let the background refresh land.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let converged = runner.stale_while_revalidate(&request).await;
    assert_eq!(converged.body, b"gen2");
  }

  #[tokio::test]
  async fn test_swr_failed_refresh_keeps_stale_entry() {
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.push_ok(Response::new(200, b"gen1".to_vec()));
    // Next two calls fail: the background refresh and the final read's refresh.
    let runner = runner(fetcher);
    let request = get("https://app.local/api/foods");

    runner.stale_while_revalidate(&request).await;
    let served = runner.stale_while_revalidate(&request).await;
    assert_eq!(served.body, b"gen1");

    tokio::time::sleep(Duration::from_millis(50)).await;
    let still_served = runner.stale_while_revalidate(&request).await;
    assert_eq!(still_served.body, b"gen1");
  }

  #[tokio::test]
  async fn test_swr_miss_offline_is_503() {
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.push_err();
    let runner = runner(fetcher);

    let response = runner
      .stale_while_revalidate(&get("https://app.local/api/foods"))
      .await;
    assert_eq!(response.status, 503);
  }

  #[tokio::test]
  async fn test_post_and_get_do_not_collide() {
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.push_ok(Response::new(200, b"get".to_vec()));
    fetcher.push_err();
    let runner = runner(fetcher);

    let url = url::Url::parse("https://app.local/api/weight").unwrap();
    runner.network_first(&Request::get(url.clone())).await;

    // Offline POST finds no cached copy under its own key.
    let post = Request::post(url, b"{}".to_vec());
    assert_eq!(runner.network_first(&post).await.status, 503);
  }
}
