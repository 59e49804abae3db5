//! Session namespacing decorator over a shared store.

use super::{StateStore, StoreError};
use serde_json::Value;
use std::sync::Arc;

/// Sentinel session identifier designating the global scope.
pub const GLOBAL_SESSION: &str = "GLOBAL";

/// Prefixes every key with a namespace before delegating to a shared inner
/// store. `close()` is deferred: the inner store is shared across sessions
/// and is closed by its owner, not by this wrapper.
pub struct NamespacedStore {
    inner: Arc<dyn StateStore>,
    prefix: String,
}

impl NamespacedStore {
    pub fn new(inner: Arc<dyn StateStore>, prefix: impl Into<String>) -> Self {
        NamespacedStore {
            inner,
            prefix: prefix.into(),
        }
    }

    /// Namespace for a session identifier; the `GLOBAL` sentinel maps to
    /// the global scope.
    pub fn for_session(inner: Arc<dyn StateStore>, session_id: &str) -> Self {
        let prefix = if session_id == GLOBAL_SESSION {
            "global:".to_string()
        } else {
            format!("session:{session_id}:")
        };
        NamespacedStore::new(inner, prefix)
    }

    /// The global-scope namespace over the same shared store.
    pub fn global(inner: Arc<dyn StateStore>) -> Self {
        NamespacedStore::new(inner, "global:")
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

impl StateStore for NamespacedStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.inner.get(&self.full_key(key))
    }

    fn set(&self, key: &str, value: Value, ttl: Option<u64>) -> Result<(), StoreError> {
        self.inner.set(&self.full_key(key), value, ttl)
    }

    fn del(&self, key: &str) -> Result<(), StoreError> {
        self.inner.del(&self.full_key(key))
    }

    fn increment(&self, key: &str, by: f64) -> Result<Value, StoreError> {
        self.inner.increment(&self.full_key(key), by)
    }

    fn patch(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.inner.patch(&self.full_key(key), value)
    }

    fn close(&self) -> Result<(), StoreError> {
        // The inner store is shared; its owner closes it.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryStoreConfig;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn shared() -> Arc<dyn StateStore> {
        Arc::new(MemoryStore::new(MemoryStoreConfig::default()))
    }

    #[test]
    fn test_sessions_are_isolated() {
        let inner = shared();
        let a = NamespacedStore::for_session(Arc::clone(&inner), "alice");
        let b = NamespacedStore::for_session(Arc::clone(&inner), "bob");

        a.set("k", json!("from-a"), None).unwrap();
        b.set("k", json!("from-b"), None).unwrap();

        assert_eq!(a.get("k").unwrap(), Some(json!("from-a")));
        assert_eq!(b.get("k").unwrap(), Some(json!("from-b")));
    }

    #[test]
    fn test_global_sentinel_maps_to_global_scope() {
        let inner = shared();
        let global = NamespacedStore::for_session(Arc::clone(&inner), GLOBAL_SESSION);
        global.set("k", json!(1), None).unwrap();

        assert_eq!(inner.get("global:k").unwrap(), Some(json!(1)));
        assert_eq!(inner.get("session:GLOBAL:k").unwrap(), None);
    }

    #[test]
    fn test_close_does_not_close_inner() {
        let inner = shared();
        let ns = NamespacedStore::for_session(Arc::clone(&inner), "s");
        ns.set("k", json!(1), None).unwrap();
        ns.close().unwrap();
        // inner store still usable
        inner.set("other", json!(2), None).unwrap();
        assert_eq!(inner.get("other").unwrap(), Some(json!(2)));
    }
}
