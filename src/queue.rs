//! Persisted FIFO queue of deferred mutations.
//!
//! Mutations attempted while offline land here and are replayed in order when
//! connectivity returns. Each task gets a bounded number of attempts across
//! separate drains; at the cap it is abandoned with a log line and nothing
//! else, since the user already moved on when the mutation was queued.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::http::{Fetcher, Request};

/// One deferred mutation.
#[derive(Debug, Clone)]
pub struct QueuedTask {
  pub id: String,
  pub kind: String,
  pub payload: serde_json::Value,
  pub enqueued_at: DateTime<Utc>,
  /// Attempts so far. Monotonically non-decreasing, capped by the queue.
  pub retry_count: u32,
}

/// Outcome counts of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub completed: usize,
  pub retried: usize,
  pub abandoned: usize,
}

/// Replays one task against its backend.
pub trait TaskExecutor: Send + Sync {
  fn execute(&self, task: &QueuedTask) -> impl Future<Output = Result<()>> + Send;
}

/// Schema for the persisted queue.
const QUEUE_SCHEMA: &str = r#"
-- FIFO order comes from the autoincrement sequence; retry updates are keyed
-- by task id so they never disturb ordering.
CREATE TABLE IF NOT EXISTS sync_tasks (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    enqueued_at TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0
);
"#;

/// The persisted sync queue. Exclusively owns its rows; no other component
/// reads or writes them.
pub struct SyncQueue {
  conn: Mutex<Connection>,
  max_retries: u32,
  draining: AtomicBool,
}

impl SyncQueue {
  /// Open or create the queue database at the given path.
  pub fn open_at(path: &Path, max_retries: u32) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create queue directory: {}", e))?;
    }
    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open queue database at {}: {}", path.display(), e))?;
    Self::with_connection(conn, max_retries)
  }

  /// Ephemeral queue for tests.
  pub fn in_memory(max_retries: u32) -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory queue: {}", e))?;
    Self::with_connection(conn, max_retries)
  }

  fn with_connection(conn: Connection, max_retries: u32) -> Result<Self> {
    conn
      .execute_batch(QUEUE_SCHEMA)
      .map_err(|e| eyre!("Failed to run queue migrations: {}", e))?;
    Ok(Self {
      conn: Mutex::new(conn),
      max_retries,
      draining: AtomicBool::new(false),
    })
  }

  /// Append a task. Always succeeds structurally; assigns a locally-unique
  /// id and timestamp.
  pub fn enqueue(&self, kind: &str, payload: serde_json::Value) -> Result<String> {
    static NEXT: AtomicU64 = AtomicU64::new(1);

    let now = Utc::now();
    let id = format!(
      "task-{}-{}",
      now.timestamp_millis(),
      NEXT.fetch_add(1, Ordering::SeqCst)
    );

    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    conn
      .execute(
        "INSERT INTO sync_tasks (id, kind, payload, enqueued_at, retry_count)
         VALUES (?, ?, ?, ?, 0)",
        params![id, kind, payload.to_string(), now.to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to enqueue {} task: {}", kind, e))?;

    debug!("queued {} task {}", kind, id);
    Ok(id)
  }

  /// Number of pending tasks.
  pub fn len(&self) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM sync_tasks", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count tasks: {}", e))?;
    Ok(count as usize)
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  /// Snapshot of pending tasks in FIFO order.
  pub fn tasks(&self) -> Result<Vec<QueuedTask>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let mut stmt = conn
      .prepare(
        "SELECT id, kind, payload, enqueued_at, retry_count FROM sync_tasks ORDER BY seq",
      )
      .map_err(|e| eyre!("Failed to prepare task listing: {}", e))?;

    let rows: Vec<(String, String, String, String, u32)> = stmt
      .query_map([], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
        ))
      })
      .map_err(|e| eyre!("Failed to list tasks: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    let mut tasks = Vec::with_capacity(rows.len());
    for (id, kind, payload, enqueued_at, retry_count) in rows {
      let payload = serde_json::from_str(&payload)
        .map_err(|e| eyre!("Failed to deserialize payload of {}: {}", id, e))?;
      let enqueued_at = DateTime::parse_from_rfc3339(&enqueued_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| eyre!("Failed to parse enqueued_at of {}: {}", id, e))?;
      tasks.push(QueuedTask {
        id,
        kind,
        payload,
        enqueued_at,
        retry_count,
      });
    }
    Ok(tasks)
  }

  /// Process the current snapshot of the queue, one task at a time.
  ///
  /// No-op when offline or when a drain is already running. Tasks enqueued
  /// during the pass are not part of the snapshot. A failed task is left for
  /// the NEXT drain trigger, never busy-retried within the same pass; once
  /// its attempt count reaches the cap it is dropped.
  pub async fn drain<E: TaskExecutor>(&self, online: bool, executor: &E) -> Result<DrainReport> {
    if !online {
      debug!("drain skipped: offline");
      return Ok(DrainReport::default());
    }
    if self.draining.swap(true, Ordering::SeqCst) {
      debug!("drain skipped: already draining");
      return Ok(DrainReport::default());
    }

    let result = self.drain_snapshot(executor).await;
    self.draining.store(false, Ordering::SeqCst);
    result
  }

  async fn drain_snapshot<E: TaskExecutor>(&self, executor: &E) -> Result<DrainReport> {
    let snapshot = self.tasks()?;
    let mut report = DrainReport::default();

    for task in snapshot {
      match executor.execute(&task).await {
        Ok(()) => {
          self.remove(&task.id)?;
          report.completed += 1;
          debug!("task {} ({}) done", task.id, task.kind);
        }
        Err(e) => {
          let attempts = task.retry_count + 1;
          if attempts >= self.max_retries {
            self.remove(&task.id)?;
            report.abandoned += 1;
            warn!(
              "abandoning task {} ({}) after {} attempts: {}",
              task.id, task.kind, attempts, e
            );
          } else {
            self.set_retry_count(&task.id, attempts)?;
            report.retried += 1;
            debug!(
              "task {} ({}) failed (attempt {}/{}): {}",
              task.id, task.kind, attempts, self.max_retries, e
            );
          }
        }
      }
    }

    if report != DrainReport::default() {
      info!(
        "drain complete: {} done, {} left for retry, {} abandoned",
        report.completed, report.retried, report.abandoned
      );
    }
    Ok(report)
  }

  fn remove(&self, id: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    conn
      .execute("DELETE FROM sync_tasks WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove task {}: {}", id, e))?;
    Ok(())
  }

  fn set_retry_count(&self, id: &str, retry_count: u32) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    conn
      .execute(
        "UPDATE sync_tasks SET retry_count = ? WHERE id = ?",
        params![retry_count, id],
      )
      .map_err(|e| eyre!("Failed to update retry count of {}: {}", id, e))?;
    Ok(())
  }
}

/// Replays deferred mutations over HTTP. Payload convention:
/// `{"url": "...", "body": <json>}` — the body is POSTed to the URL.
pub struct HttpTaskExecutor<F> {
  fetcher: Arc<F>,
}

impl<F: Fetcher> HttpTaskExecutor<F> {
  pub fn new(fetcher: Arc<F>) -> Self {
    Self { fetcher }
  }
}

impl<F: Fetcher> TaskExecutor for HttpTaskExecutor<F> {
  fn execute(&self, task: &QueuedTask) -> impl Future<Output = Result<()>> + Send {
    let fetcher = Arc::clone(&self.fetcher);
    let task = task.clone();

    async move {
      let url = task
        .payload
        .get("url")
        .and_then(|v| v.as_str())
        .ok_or_else(|| eyre!("Task {} payload has no url", task.id))?;
      let url = url::Url::parse(url)
        .map_err(|e| eyre!("Task {} has invalid url {}: {}", task.id, url, e))?;
      let body = task
        .payload
        .get("body")
        .map(|v| v.to_string().into_bytes())
        .unwrap_or_default();

      let request = Request::post(url, body);
      let response = fetcher.fetch(&request).await?;
      if response.ok() {
        Ok(())
      } else {
        Err(eyre!(
          "Endpoint rejected task {} with status {}",
          task.id,
          response.status
        ))
      }
    }
  }
}
