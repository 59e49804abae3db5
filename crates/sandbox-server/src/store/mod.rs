//! Session-scoped state store abstraction.
//!
//! A uniform key/value contract implemented by three backends: in-memory
//! with a timing wheel, an append-log file with snapshot compaction, and a
//! networked redis store. The store sees only flat keys; the request
//! pipeline injects session namespaces through [`NamespacedStore`].

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

pub mod file;
pub mod memory;
mod namespace;
#[cfg(feature = "redis-backend")]
pub mod redis;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use namespace::{NamespacedStore, GLOBAL_SESSION};

/// Errors surfaced by store backends. The request pipeline maps these to
/// 500-class problem documents.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("store is closed")]
    Closed,
}

/// One stored value with its expiry and bookkeeping timestamps.
///
/// Timestamps are epoch milliseconds. `expires_at` is absolute; expiry is
/// checked on read and on sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Entry {
    pub fn new(value: Value, ttl_seconds: Option<u64>) -> Self {
        let now = now_millis();
        Entry {
            value,
            expires_at: ttl_seconds.map(|t| now + (t as i64) * 1000),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now_ms)
    }
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Uniform state store contract. All operations may fail with a
/// [`StoreError`]; per-key operations are serialized by each backend.
///
/// The trait is intentionally synchronous: backends complete quickly or use
/// pooled blocking connections, which keeps it callable from the expression
/// evaluator without async bridging.
pub trait StateStore: Send + Sync {
    /// Read a value; absent and expired entries both return `None`.
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Write a value. A `ttl` (seconds) installs an absolute expiry; no
    /// `ttl` leaves the entry permanent, discarding any prior expiry.
    fn set(&self, key: &str, value: Value, ttl: Option<u64>) -> Result<(), StoreError>;

    /// Remove a key. Removing an absent key is not an error.
    fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Atomically add `by` to the stored number and return the new value.
    /// Absent or non-numeric prior values count as 0. The prior expiry is
    /// preserved.
    fn increment(&self, key: &str, by: f64) -> Result<Value, StoreError>;

    /// Merge a value into the existing one (see [`deep_merge`]). The prior
    /// expiry is preserved.
    fn patch(&self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Flush and release backend resources. Further operations fail.
    fn close(&self) -> Result<(), StoreError>;
}

/// Merge `incoming` into `existing`.
///
/// Two objects merge with one level of key override (nested objects
/// replace); two arrays concatenate with the existing elements first;
/// every other combination replaces.
pub fn deep_merge(existing: Option<&Value>, incoming: Value) -> Value {
    match (existing, incoming) {
        (Some(Value::Object(old)), Value::Object(new)) => {
            let mut merged = old.clone();
            for (k, v) in new {
                merged.insert(k, v);
            }
            Value::Object(merged)
        }
        (Some(Value::Array(old)), Value::Array(new)) => {
            let mut merged = old.clone();
            merged.extend(new);
            Value::Array(merged)
        }
        (_, incoming) => incoming,
    }
}

/// Add `by` to a prior value, treating absent or non-numeric priors as 0.
/// The result stays a JSON integer while the arithmetic is exact.
pub fn add_numeric(prior: Option<&Value>, by: f64) -> Value {
    let base = prior.and_then(Value::as_f64).unwrap_or(0.0);
    number_value(base + by)
}

/// Build a JSON number, collapsing to an integer when the value is whole.
pub fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Build the configured backend behind the uniform contract.
pub fn create_store(config: &crate::config::StoreConfig) -> anyhow::Result<Arc<dyn StateStore>> {
    use crate::config::StoreConfig;

    match config {
        StoreConfig::Memory(cfg) => {
            tracing::info!(
                max_size = cfg.max_size,
                default_ttl = ?cfg.default_ttl,
                "using in-memory state store"
            );
            Ok(Arc::new(MemoryStore::new(cfg.clone())))
        }
        StoreConfig::File(cfg) => {
            let store = FileStore::open(cfg.clone())?;
            tracing::info!(path = %cfg.path.display(), "using file state store");
            Ok(Arc::new(store))
        }
        StoreConfig::Network(cfg) => {
            #[cfg(feature = "redis-backend")]
            {
                let store = redis::RedisStore::connect(cfg)?;
                tracing::info!(host = %cfg.host, port = cfg.port, "using redis state store");
                Ok(Arc::new(store))
            }
            #[cfg(not(feature = "redis-backend"))]
            {
                let _ = cfg;
                Err(anyhow::anyhow!(
                    "network backend not available; compile with --features redis-backend"
                ))
            }
        }
    }
}
