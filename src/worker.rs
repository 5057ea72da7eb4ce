//! The offline worker: lifecycle, request dispatch and the client protocol.
//!
//! One worker instance owns the cache store, the strategy runner and the
//! sync queue. The host runtime delivers lifecycle events (`install`,
//! `activate`, intercepted fetches, background sync) and client messages;
//! everything here is host-agnostic so tests drive it directly.

use color_eyre::{eyre::eyre, Result};
use futures::future;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStore, CachedResponse, RequestKey};
use crate::config::WorkerConfig;
use crate::http::{Fetcher, Request, Response};
use crate::queue::{DrainReport, SyncQueue, TaskExecutor};
use crate::routes::{classify, RoutingClass, Strategy};
use crate::strategy::StrategyRunner;

/// Background sync registrations are gated on this tag.
pub const SYNC_TAG: &str = "sync-pending-data";

/// Task kind for mutations deferred automatically by the fetch path.
pub const DEFERRED_MUTATION_KIND: &str = "DEFERRED_MUTATION";

/// Pseudo-URL keying the user-data snapshot in the data namespace.
const USER_DATA_URL: &str = "fitsync://local/user-data";

/// Messages a page can post to the worker.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
  /// Fire-and-forget: snapshot arbitrary user data into the data namespace.
  CacheData { payload: serde_json::Value },
  GetCacheStatus,
  ClearCache,
}

/// Replies over the message channel. Every request-type message gets one;
/// `CACHE_DATA` is the only fire-and-forget message.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum WorkerReply {
  CacheStatus {
    caches: usize,
    #[serde(rename = "totalSize")]
    total_size: u64,
    status: String,
  },
  Cleared {
    status: String,
  },
  Error {
    status: String,
    error: String,
  },
}

/// Notifications pushed to open pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
  /// A new worker generation activated and took control.
  Updated { generation: String },
}

/// The network-intercepting worker.
pub struct OfflineWorker<S, F> {
  config: WorkerConfig,
  page_origin: Url,
  store: Arc<S>,
  fetcher: Arc<F>,
  runner: StrategyRunner<S, F>,
  queue: SyncQueue,
  online: AtomicBool,
  events: mpsc::UnboundedSender<WorkerEvent>,
}

impl<S, F> OfflineWorker<S, F>
where
  S: CacheStore + 'static,
  F: Fetcher + 'static,
{
  /// Wire up a worker. Returns the receiving end of the page notification
  /// channel alongside it.
  pub fn new(
    config: WorkerConfig,
    store: Arc<S>,
    fetcher: Arc<F>,
    queue: SyncQueue,
  ) -> Result<(Self, mpsc::UnboundedReceiver<WorkerEvent>)> {
    let page_origin = Url::parse(&config.origin)
      .map_err(|e| eyre!("Invalid page origin {}: {}", config.origin, e))?;
    let runner = StrategyRunner::new(
      Arc::clone(&store),
      Arc::clone(&fetcher),
      config.static_namespace(),
      config.dynamic_namespace(),
    );
    let (tx, rx) = mpsc::unbounded_channel();

    let worker = Self {
      config,
      page_origin,
      store,
      fetcher,
      runner,
      queue,
      online: AtomicBool::new(true),
      events: tx,
    };
    Ok((worker, rx))
  }

  /// Connectivity flag, set by the host. Consulted by the drain path and by
  /// mutation deferral.
  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }

  /// Install: precache the critical asset manifest into the static
  /// namespace and create the data namespace placeholder. Any precache
  /// failure fails the install. Readiness is immediate; there is no waiting
  /// for old clients to close.
  pub async fn install(&self) -> Result<()> {
    self.store.open(&self.config.static_namespace())?;
    self.store.open(&self.config.data_namespace())?;

    let fetches = self
      .config
      .static_manifest
      .iter()
      .map(|path| self.precache(path));
    for result in future::join_all(fetches).await {
      result?;
    }

    info!(
      "generation {} installed, replacing any prior worker immediately",
      self.config.generation
    );
    Ok(())
  }

  async fn precache(&self, path: &str) -> Result<()> {
    let url = self
      .page_origin
      .join(path)
      .map_err(|e| eyre!("Invalid manifest path {}: {}", path, e))?;
    let request = Request::get(url);
    let response = self.fetcher.fetch(&request).await?;
    if !response.ok() {
      return Err(eyre!("Precache of {} returned status {}", path, response.status));
    }

    let key = RequestKey::for_request(&request);
    self
      .store
      .put(&self.config.static_namespace(), &key, &CachedResponse::capture(&response))
  }

  /// Activate: drop every namespace that does not belong to this generation,
  /// take control of open pages and notify each of them.
  pub fn activate(&self) -> Result<()> {
    let expected = self.config.expected_namespaces();
    for name in self.store.list_namespaces()? {
      if !expected.contains(&name) {
        info!("deleting superseded cache namespace {}", name);
        self.store.delete_namespace(&name)?;
      }
    }

    // Ignore send errors - receiver may have been dropped
    let _ = self.events.send(WorkerEvent::Updated {
      generation: self.config.generation.clone(),
    });
    Ok(())
  }

  /// Intercept one request and always resolve to a response; nothing is
  /// allowed to escape this path as an error.
  pub async fn handle(&self, request: &Request) -> Response {
    // A mutation attempted while offline is deferred rather than failed.
    if request.method.is_mutating() && !self.is_online() {
      match self.defer_mutation(request) {
        Ok(task_id) => {
          debug!("deferred offline {} {} as {}", request.method, request.url, task_id);
          return Response::accepted_for_sync(&task_id);
        }
        Err(e) => {
          warn!("failed to defer {} {}: {}", request.method, request.url, e);
          // Fall through and let the strategy produce a degraded response.
        }
      }
    }

    let class = classify(request, &self.page_origin, &self.config.static_prefixes);
    let strategy = self.strategy_for(request, class);
    debug!(
      "{} {} classified {} -> {:?}",
      request.method,
      request.url,
      class.as_str(),
      strategy
    );

    match strategy {
      Strategy::CacheFirst => self.runner.cache_first(request).await,
      Strategy::NetworkFirst => self.runner.network_first(request).await,
      Strategy::NetworkFirstWithFallback => {
        self.runner.network_first_with_fallback(request).await
      }
      Strategy::StaleWhileRevalidate => self.runner.stale_while_revalidate(request).await,
    }
  }

  /// Same-origin uncategorized requests under a revalidate prefix (food and
  /// exercise banks) trade one generation of staleness for zero latency.
  fn strategy_for(&self, request: &Request, class: RoutingClass) -> Strategy {
    if class == RoutingClass::Other {
      let path = request.url.path();
      if self
        .config
        .revalidate_prefixes
        .iter()
        .any(|p| path.starts_with(p.as_str()))
      {
        return Strategy::StaleWhileRevalidate;
      }
    }
    class.strategy()
  }

  fn defer_mutation(&self, request: &Request) -> Result<String> {
    let body: serde_json::Value = match &request.body {
      Some(bytes) => serde_json::from_slice(bytes)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())),
      None => serde_json::Value::Null,
    };
    let payload = serde_json::json!({
      "url": request.url.as_str(),
      "body": body,
    });
    self.queue.enqueue(DEFERRED_MUTATION_KIND, payload)
  }

  /// Queue a mutation explicitly on behalf of a caller.
  pub fn enqueue_mutation(&self, kind: &str, payload: serde_json::Value) -> Result<String> {
    self.queue.enqueue(kind, payload)
  }

  /// Background sync signal: drain the pending-mutation queue. Foreign tags
  /// are ignored.
  pub async fn on_sync<E: TaskExecutor>(&self, tag: &str, executor: &E) -> Result<DrainReport> {
    if tag != SYNC_TAG {
      debug!("ignoring sync signal with tag {}", tag);
      return Ok(DrainReport::default());
    }
    self.queue.drain(self.is_online(), executor).await
  }

  pub fn pending_mutations(&self) -> Result<usize> {
    self.queue.len()
  }

  /// Typed message entry point. Returns None for fire-and-forget messages.
  pub fn handle_message(&self, message: ClientMessage) -> Option<WorkerReply> {
    match message {
      ClientMessage::CacheData { payload } => {
        if let Err(e) = self.cache_user_data(&payload) {
          warn!("failed to snapshot user data: {}", e);
        }
        None
      }
      ClientMessage::GetCacheStatus => Some(self.status_reply()),
      ClientMessage::ClearCache => Some(self.clear_reply()),
    }
  }

  /// Raw message entry point for hosts that deliver JSON strings. A
  /// malformed message gets an error reply; the requester's port is never
  /// left unanswered.
  pub fn handle_raw_message(&self, raw: &str) -> Option<WorkerReply> {
    match serde_json::from_str::<ClientMessage>(raw) {
      Ok(message) => self.handle_message(message),
      Err(e) => Some(WorkerReply::Error {
        status: "error".to_string(),
        error: format!("malformed message: {}", e),
      }),
    }
  }

  fn cache_user_data(&self, payload: &serde_json::Value) -> Result<()> {
    let body =
      serde_json::to_vec(payload).map_err(|e| eyre!("Failed to serialize user data: {}", e))?;
    let response = Response::new(200, body).with_header("content-type", "application/json");
    let key = RequestKey::from_parts("GET", USER_DATA_URL);
    self
      .store
      .put(&self.config.data_namespace(), &key, &CachedResponse::capture(&response))
  }

  /// Last snapshot stored via `CACHE_DATA`, if any.
  pub fn user_data_snapshot(&self) -> Result<Option<serde_json::Value>> {
    let key = RequestKey::from_parts("GET", USER_DATA_URL);
    match self.store.lookup(&self.config.data_namespace(), &key)? {
      Some(entry) => {
        let value = serde_json::from_slice(&entry.body)
          .map_err(|e| eyre!("Corrupt user data snapshot: {}", e))?;
        Ok(Some(value))
      }
      None => Ok(None),
    }
  }

  fn status_reply(&self) -> WorkerReply {
    match (self.store.list_namespaces(), self.store.estimate_total_size()) {
      (Ok(namespaces), Ok(total_size)) => WorkerReply::CacheStatus {
        caches: namespaces.len(),
        total_size,
        status: "ready".to_string(),
      },
      (Err(e), _) | (_, Err(e)) => {
        warn!("cache status query failed: {}", e);
        WorkerReply::CacheStatus {
          caches: 0,
          total_size: 0,
          status: "error".to_string(),
        }
      }
    }
  }

  fn clear_reply(&self) -> WorkerReply {
    match self.clear_all_namespaces() {
      Ok(()) => WorkerReply::Cleared {
        status: "cleared".to_string(),
      },
      Err(e) => WorkerReply::Error {
        status: "error".to_string(),
        error: e.to_string(),
      },
    }
  }

  fn clear_all_namespaces(&self) -> Result<()> {
    for name in self.store.list_namespaces()? {
      self.store.delete_namespace(&name)?;
    }
    Ok(())
  }
}
