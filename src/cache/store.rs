//! Cache store trait with SQLite and in-memory implementations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use super::types::{CachedResponse, RequestKey};

/// Storage backend for namespaced response caches.
///
/// All operations are whole-entry: `put` overwrites, `lookup` is exact.
/// Implementations must be safe for concurrent use; concurrent writes to the
/// same key are last-writer-wins.
pub trait CacheStore: Send + Sync {
  /// Create the namespace if absent. Idempotent.
  fn open(&self, namespace: &str) -> Result<()>;

  /// Exact lookup by key. Returns None on miss.
  fn lookup(&self, namespace: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Store an entry, overwriting any existing entry for the key.
  fn put(&self, namespace: &str, key: &RequestKey, response: &CachedResponse) -> Result<()>;

  /// Delete one entry. Returns whether an entry existed.
  fn delete(&self, namespace: &str, key: &RequestKey) -> Result<bool>;

  /// All namespace names currently present.
  fn list_namespaces(&self) -> Result<Vec<String>>;

  /// Delete a namespace and everything in it. Returns whether it existed.
  fn delete_namespace(&self, name: &str) -> Result<bool>;

  /// Sum of body byte lengths across every entry in every namespace.
  ///
  /// Diagnostics only: this re-reads every stored body on each call, so it is
  /// O(total cache size). Callers must not put it on a hot path.
  fn estimate_total_size(&self) -> Result<u64>;
}

/// SQLite-backed store; the production backend.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Namespace registry (one row per logical cache)
CREATE TABLE IF NOT EXISTS namespaces (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

-- Captured responses, keyed on the hashed request key within a namespace
CREATE TABLE IF NOT EXISTS entries (
    namespace TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (namespace, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_entries_namespace ON entries(namespace);
"#;

impl SqliteStore {
  /// Open or create the store at the given path.
  pub fn open_at(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Ephemeral store for tests and one-off inspection.
  pub fn in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory cache: {}", e))?;
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;
    Ok(())
  }
}

impl CacheStore for SqliteStore {
  fn open(&self, namespace: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    conn
      .execute(
        "INSERT OR IGNORE INTO namespaces (name, created_at) VALUES (?, ?)",
        params![namespace, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to open namespace {}: {}", namespace, e))?;
    Ok(())
  }

  fn lookup(&self, namespace: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT status, headers, body, cached_at FROM entries
         WHERE namespace = ? AND key_hash = ?",
      )
      .map_err(|e| eyre!("Failed to prepare lookup: {}", e))?;

    let row: Option<(u16, String, Vec<u8>, String)> = stmt
      .query_row(params![namespace, key.storage_hash()], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .ok();

    match row {
      Some((status, headers_json, body, cached_at_str)) => {
        let headers: BTreeMap<String, String> = serde_json::from_str(&headers_json)
          .map_err(|e| eyre!("Failed to deserialize cached headers: {}", e))?;
        let cached_at = parse_datetime(&cached_at_str)?;
        Ok(Some(CachedResponse {
          status,
          headers,
          body,
          cached_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, namespace: &str, key: &RequestKey, response: &CachedResponse) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let headers_json = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    // Registering the namespace here keeps lazy writers (dynamic cache)
    // consistent with the namespace listing.
    conn
      .execute(
        "INSERT OR IGNORE INTO namespaces (name, created_at) VALUES (?, ?)",
        params![namespace, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to register namespace {}: {}", namespace, e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO entries (namespace, key_hash, method, url, status, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
          namespace,
          key.storage_hash(),
          key.method(),
          key.url(),
          response.status,
          headers_json,
          response.body,
          response.cached_at.to_rfc3339(),
        ],
      )
      .map_err(|e| eyre!("Failed to store entry for {}: {}", key.canonical(), e))?;

    Ok(())
  }

  fn delete(&self, namespace: &str, key: &RequestKey) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let changed = conn
      .execute(
        "DELETE FROM entries WHERE namespace = ? AND key_hash = ?",
        params![namespace, key.storage_hash()],
      )
      .map_err(|e| eyre!("Failed to delete entry for {}: {}", key.canonical(), e))?;
    Ok(changed > 0)
  }

  fn list_namespaces(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let mut stmt = conn
      .prepare("SELECT name FROM namespaces ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare namespace listing: {}", e))?;
    let names: Vec<String> = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list namespaces: {}", e))?
      .filter_map(|r| r.ok())
      .collect();
    Ok(names)
  }

  fn delete_namespace(&self, name: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    conn
      .execute("DELETE FROM entries WHERE namespace = ?", params![name])
      .map_err(|e| eyre!("Failed to clear namespace {}: {}", name, e))?;
    let changed = conn
      .execute("DELETE FROM namespaces WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete namespace {}: {}", name, e))?;
    Ok(changed > 0)
  }

  fn estimate_total_size(&self) -> Result<u64> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let mut stmt = conn
      .prepare("SELECT body FROM entries")
      .map_err(|e| eyre!("Failed to prepare size scan: {}", e))?;

    // Deliberately re-reads every body; see trait docs.
    let total: u64 = stmt
      .query_map([], |row| {
        let body: Vec<u8> = row.get(0)?;
        Ok(body.len() as u64)
      })
      .map_err(|e| eyre!("Failed to scan entry bodies: {}", e))?
      .filter_map(|r| r.ok())
      .sum();

    Ok(total)
  }
}

/// In-memory store for tests and callers that disable persistence.
#[derive(Default)]
pub struct MemoryStore {
  namespaces: Mutex<BTreeMap<String, BTreeMap<String, CachedResponse>>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl CacheStore for MemoryStore {
  fn open(&self, namespace: &str) -> Result<()> {
    let mut namespaces = self
      .namespaces
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    namespaces.entry(namespace.to_string()).or_default();
    Ok(())
  }

  fn lookup(&self, namespace: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let namespaces = self
      .namespaces
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(
      namespaces
        .get(namespace)
        .and_then(|entries| entries.get(&key.canonical()))
        .cloned(),
    )
  }

  fn put(&self, namespace: &str, key: &RequestKey, response: &CachedResponse) -> Result<()> {
    let mut namespaces = self
      .namespaces
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    namespaces
      .entry(namespace.to_string())
      .or_default()
      .insert(key.canonical(), response.clone());
    Ok(())
  }

  fn delete(&self, namespace: &str, key: &RequestKey) -> Result<bool> {
    let mut namespaces = self
      .namespaces
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(
      namespaces
        .get_mut(namespace)
        .map(|entries| entries.remove(&key.canonical()).is_some())
        .unwrap_or(false),
    )
  }

  fn list_namespaces(&self) -> Result<Vec<String>> {
    let namespaces = self
      .namespaces
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(namespaces.keys().cloned().collect())
  }

  fn delete_namespace(&self, name: &str) -> Result<bool> {
    let mut namespaces = self
      .namespaces
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(namespaces.remove(name).is_some())
  }

  fn estimate_total_size(&self) -> Result<u64> {
    let namespaces = self
      .namespaces
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(
      namespaces
        .values()
        .flat_map(|entries| entries.values())
        .map(|entry| entry.body.len() as u64)
        .sum(),
    )
  }
}

/// Parse an RFC 3339 timestamp as stored by `put`.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::{Method, Response};

  fn key(url: &str) -> RequestKey {
    RequestKey::new(Method::Get, &url::Url::parse(url).unwrap())
  }

  fn entry(body: &[u8]) -> CachedResponse {
    CachedResponse::capture(&Response::new(200, body.to_vec()))
  }

  fn stores() -> Vec<Box<dyn CacheStore>> {
    vec![
      Box::new(SqliteStore::in_memory().unwrap()),
      Box::new(MemoryStore::new()),
    ]
  }

  #[test]
  fn test_put_and_lookup() {
    for store in stores() {
      let k = key("https://app.local/styles/main.css");
      store.put("static-v1", &k, &entry(b"body{}")).unwrap();

      let found = store.lookup("static-v1", &k).unwrap().unwrap();
      assert_eq!(found.body, b"body{}");
      assert_eq!(found.status, 200);
    }
  }

  #[test]
  fn test_lookup_is_exact() {
    for store in stores() {
      let k = key("https://app.local/a");
      store.put("static-v1", &k, &entry(b"a")).unwrap();

      assert!(store
        .lookup("static-v1", &key("https://app.local/a?x=1"))
        .unwrap()
        .is_none());
      assert!(store.lookup("dynamic-v1", &k).unwrap().is_none());
    }
  }

  #[test]
  fn test_put_overwrites_whole_entry() {
    for store in stores() {
      let k = key("https://app.local/app.js");
      store.put("static-v1", &k, &entry(b"version1")).unwrap();
      store.put("static-v1", &k, &entry(b"v2")).unwrap();

      let found = store.lookup("static-v1", &k).unwrap().unwrap();
      assert_eq!(found.body, b"v2");
    }
  }

  #[test]
  fn test_delete_entry() {
    for store in stores() {
      let k = key("https://app.local/a");
      store.put("static-v1", &k, &entry(b"a")).unwrap();

      assert!(store.delete("static-v1", &k).unwrap());
      assert!(!store.delete("static-v1", &k).unwrap());
      assert!(store.lookup("static-v1", &k).unwrap().is_none());
    }
  }

  #[test]
  fn test_open_is_idempotent() {
    for store in stores() {
      store.open("data-v1").unwrap();
      store.open("data-v1").unwrap();
      assert_eq!(store.list_namespaces().unwrap(), vec!["data-v1"]);
    }
  }

  #[test]
  fn test_put_registers_namespace() {
    for store in stores() {
      store
        .put("dynamic-v1", &key("https://app.local/x"), &entry(b"x"))
        .unwrap();
      assert!(store
        .list_namespaces()
        .unwrap()
        .contains(&"dynamic-v1".to_string()));
    }
  }

  #[test]
  fn test_delete_namespace_removes_entries() {
    for store in stores() {
      let k = key("https://app.local/a");
      store.put("static-v0", &k, &entry(b"old")).unwrap();

      assert!(store.delete_namespace("static-v0").unwrap());
      assert!(!store.delete_namespace("static-v0").unwrap());
      assert!(store.lookup("static-v0", &k).unwrap().is_none());
      assert_eq!(store.estimate_total_size().unwrap(), 0);
    }
  }

  #[test]
  fn test_estimate_total_size_spans_namespaces() {
    for store in stores() {
      store
        .put("static-v1", &key("https://app.local/a"), &entry(b"aaaa"))
        .unwrap();
      store
        .put("dynamic-v1", &key("https://app.local/b"), &entry(b"bb"))
        .unwrap();
      assert_eq!(store.estimate_total_size().unwrap(), 6);
    }
  }

  #[test]
  fn test_headers_survive_storage() {
    let store = SqliteStore::in_memory().unwrap();
    let k = key("https://app.local/app.js");
    let response = Response::new(200, b"x".to_vec()).with_header("content-type", "text/javascript");
    store
      .put("static-v1", &k, &CachedResponse::capture(&response))
      .unwrap();

    let found = store.lookup("static-v1", &k).unwrap().unwrap();
    assert_eq!(
      found.headers.get("content-type").map(String::as_str),
      Some("text/javascript")
    );
  }
}
