//! Namespaced cache store for captured responses.
//!
//! This module provides the persistence layer the caching strategies run
//! against:
//! - Named namespaces versioned by a generation tag (static/dynamic/data)
//! - Whole-entry put/match/delete keyed on method + normalized URL
//! - Namespace enumeration and bulk deletion for generation turnover
//! - A diagnostics-only total size scan

mod store;
mod types;

pub use store::{CacheStore, MemoryStore, SqliteStore};
pub use types::{CachedResponse, RequestKey};
