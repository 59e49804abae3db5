//! Networked state store backed by redis.
//!
//! Values are serialized as JSON strings. `set` with a TTL uses atomic
//! set-with-expiry, `increment` maps to the server-side atomic numeric
//! increment, and `patch` runs a server-side script that merges and
//! re-applies any positive remaining TTL. Engines without scripting fall
//! back to a non-atomic read-merge-write; that is the only operation whose
//! semantics change by backend.
//!
//! Uses a blocking client with r2d2 connection pooling; the synchronous
//! contract avoids async bridging from the evaluator.

use super::{deep_merge, number_value, StateStore, StoreError};
use crate::config::NetworkStoreConfig;
use anyhow::{Context, Result};
use redis::{Commands, Connection};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Server-side one-level merge preserving remaining TTL.
///
/// ARGV[2] carries the incoming value's JSON kind (`array`, `object`, or
/// `other`): cjson cannot tell an empty object from an empty array once
/// both decode to an empty Lua table, and guessing would take the wrong
/// branch of the merge table. Any combination outside array-concat and
/// object-override replaces, matching `deep_merge`.
const PATCH_SCRIPT: &str = r#"
local cur = redis.call('GET', KEYS[1])
local incoming = ARGV[1]
local kind = ARGV[2]
local merged = incoming
if cur then
  local ok_cur, old = pcall(cjson.decode, cur)
  local ok_inc, new = pcall(cjson.decode, incoming)
  if ok_cur and ok_inc and type(old) == 'table' and type(new) == 'table' then
    local old_empty = next(old) == nil
    local old_is_arr = old[1] ~= nil
    if kind == 'array' and (old_is_arr or old_empty) then
      if old_empty then
        merged = incoming
      else
        for i = 1, #new do old[#old + 1] = new[i] end
        merged = cjson.encode(old)
      end
    elseif kind == 'object' and not old_is_arr then
      for k, v in pairs(new) do old[k] = v end
      merged = cjson.encode(old)
    end
  end
end
local ttl = redis.call('PTTL', KEYS[1])
redis.call('SET', KEYS[1], merged)
if ttl > 0 then redis.call('PEXPIRE', KEYS[1], ttl) end
return merged
"#;

struct ConnectionManager {
    client: redis::Client,
}

impl r2d2::ManageConnection for ConnectionManager {
    type Connection = Mutex<Connection>;
    type Error = redis::RedisError;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let conn = self.client.get_connection()?;
        Ok(Mutex::new(conn))
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        redis::cmd("PING").query(conn.get_mut().unwrap())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        false
    }
}

pub struct RedisStore {
    pool: r2d2::Pool<ConnectionManager>,
    key_prefix: String,
    /// Set after the first scripting failure so the fallback is logged once.
    scripting_unavailable: AtomicBool,
}

impl RedisStore {
    pub fn connect(config: &NetworkStoreConfig) -> Result<Self> {
        let auth = config
            .password
            .as_deref()
            .map(|p| format!(":{p}@"))
            .unwrap_or_default();
        let url = format!("redis://{}{}:{}/{}", auth, config.host, config.port, config.db);
        let client = redis::Client::open(url.as_str()).context("failed to parse redis URL")?;

        let pool = r2d2::Pool::builder()
            .max_size(config.pool_size as u32)
            .connection_timeout(std::time::Duration::from_secs(5))
            .build(ConnectionManager { client })
            .context("failed to create redis connection pool")?;

        {
            let conn = pool.get().context("failed to get connection from pool")?;
            let _: String = redis::cmd("PING")
                .query(&mut *conn.lock().unwrap())
                .context("failed to PING redis")?;
        }

        Ok(RedisStore {
            pool,
            key_prefix: config.key_prefix.clone(),
            scripting_unavailable: AtomicBool::new(false),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<ConnectionManager>, StoreError> {
        self.pool
            .get()
            .map_err(|e| StoreError::Backend(format!("redis pool: {e}")))
    }

    fn backend_err(e: redis::RedisError) -> StoreError {
        StoreError::Backend(format!("redis: {e}"))
    }

    /// Non-atomic read-merge-write used when scripting is unavailable.
    fn patch_fallback(&self, key: &str, incoming: Value) -> Result<(), StoreError> {
        if !self.scripting_unavailable.swap(true, Ordering::Relaxed) {
            tracing::debug!("redis scripting unavailable, patch degrades to read-merge-write");
        }
        let existing = self.get(key)?;
        let merged = deep_merge(existing.as_ref(), incoming);
        let payload = serde_json::to_string(&merged)?;
        let full = self.full_key(key);
        let conn = self.conn()?;
        let mut guard = conn.lock().unwrap();
        let ttl_ms: i64 = redis::cmd("PTTL")
            .arg(&full)
            .query(&mut *guard)
            .map_err(Self::backend_err)?;
        let _: () = guard.set(&full, payload).map_err(Self::backend_err)?;
        if ttl_ms > 0 {
            let _: () = redis::cmd("PEXPIRE")
                .arg(&full)
                .arg(ttl_ms)
                .query(&mut *guard)
                .map_err(Self::backend_err)?;
        }
        Ok(())
    }
}

impl StateStore for RedisStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let full = self.full_key(key);
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .lock()
            .unwrap()
            .get(&full)
            .map_err(Self::backend_err)?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: Value, ttl: Option<u64>) -> Result<(), StoreError> {
        let full = self.full_key(key);
        let payload = serde_json::to_string(&value)?;
        let conn = self.conn()?;
        let mut guard = conn.lock().unwrap();
        match ttl {
            Some(secs) => {
                let _: () = redis::cmd("SET")
                    .arg(&full)
                    .arg(payload)
                    .arg("EX")
                    .arg(secs)
                    .query(&mut *guard)
                    .map_err(Self::backend_err)?;
            }
            None => {
                let _: () = guard.set(&full, payload).map_err(Self::backend_err)?;
            }
        }
        Ok(())
    }

    fn del(&self, key: &str) -> Result<(), StoreError> {
        let full = self.full_key(key);
        let conn = self.conn()?;
        let _: () = conn
            .lock()
            .unwrap()
            .del(&full)
            .map_err(Self::backend_err)?;
        Ok(())
    }

    fn increment(&self, key: &str, by: f64) -> Result<Value, StoreError> {
        let full = self.full_key(key);
        let conn = self.conn()?;
        let mut guard = conn.lock().unwrap();

        // INCRBYFLOAT is atomic and preserves the key's TTL. It fails on
        // non-numeric payloads; those reset to the addend, matching the
        // treat-prior-as-zero contract.
        let result: Result<String, redis::RedisError> = redis::cmd("INCRBYFLOAT")
            .arg(&full)
            .arg(by)
            .query(&mut *guard);
        let new_value = match result {
            Ok(raw) => raw
                .parse::<f64>()
                .map_err(|e| StoreError::Backend(format!("redis INCRBYFLOAT result: {e}")))?,
            Err(_) => {
                let _: () = redis::cmd("SET")
                    .arg(&full)
                    .arg(by.to_string())
                    .arg("KEEPTTL")
                    .query(&mut *guard)
                    .map_err(Self::backend_err)?;
                by
            }
        };
        Ok(number_value(new_value))
    }

    fn patch(&self, key: &str, value: Value) -> Result<(), StoreError> {
        if self.scripting_unavailable.load(Ordering::Relaxed) {
            return self.patch_fallback(key, value);
        }
        let full = self.full_key(key);
        let payload = serde_json::to_string(&value)?;
        let kind = match &value {
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            _ => "other",
        };
        let conn = self.conn()?;
        let outcome: Result<String, redis::RedisError> = redis::cmd("EVAL")
            .arg(PATCH_SCRIPT)
            .arg(1)
            .arg(&full)
            .arg(&payload)
            .arg(kind)
            .query(&mut *conn.lock().unwrap());
        drop(conn);
        match outcome {
            Ok(_) => Ok(()),
            Err(_) => self.patch_fallback(key, value),
        }
    }

    fn close(&self) -> Result<(), StoreError> {
        // Pooled connections are released on drop.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config() -> NetworkStoreConfig {
        NetworkStoreConfig {
            host: "localhost".into(),
            port: 6379,
            password: None,
            db: 0,
            key_prefix: "sandbox-test:".into(),
            pool_size: 4,
        }
    }

    fn redis_available() -> bool {
        match redis::Client::open("redis://localhost:6379") {
            Ok(client) => client.get_connection().is_ok(),
            Err(_) => false,
        }
    }

    #[test]
    #[ignore] // Only run when redis is available
    fn test_redis_set_get_del() {
        if !redis_available() {
            eprintln!("Skipping test: redis not available");
            return;
        }
        let s = RedisStore::connect(&test_config()).unwrap();
        s.set("k", json!({"a": 1}), None).unwrap();
        assert_eq!(s.get("k").unwrap(), Some(json!({"a": 1})));
        s.del("k").unwrap();
        assert_eq!(s.get("k").unwrap(), None);
    }

    #[test]
    #[ignore] // Only run when redis is available
    fn test_redis_increment_exact_integer() {
        if !redis_available() {
            eprintln!("Skipping test: redis not available");
            return;
        }
        let s = RedisStore::connect(&test_config()).unwrap();
        s.del("counter").unwrap();
        assert_eq!(s.increment("counter", 1.0).unwrap(), json!(1));
        assert_eq!(s.increment("counter", 1.0).unwrap(), json!(2));
        assert_eq!(s.increment("counter", 0.5).unwrap(), json!(2.5));
        s.del("counter").unwrap();
    }

    #[test]
    #[ignore] // Only run when redis is available
    fn test_redis_patch_merges_and_keeps_ttl() {
        if !redis_available() {
            eprintln!("Skipping test: redis not available");
            return;
        }
        let s = RedisStore::connect(&test_config()).unwrap();
        s.set("obj", json!({"a": 1}), Some(60)).unwrap();
        s.patch("obj", json!({"b": 2})).unwrap();
        assert_eq!(s.get("obj").unwrap(), Some(json!({"a": 1, "b": 2})));

        let conn = s.conn().unwrap();
        let ttl: i64 = redis::cmd("TTL")
            .arg(s.full_key("obj"))
            .query(&mut *conn.lock().unwrap())
            .unwrap();
        assert!(ttl > 0, "TTL lost by patch: {ttl}");
        s.del("obj").unwrap();
    }

    #[test]
    #[ignore] // Only run when redis is available
    fn test_redis_patch_empty_collections_follow_merge_table() {
        if !redis_available() {
            eprintln!("Skipping test: redis not available");
            return;
        }
        let s = RedisStore::connect(&test_config()).unwrap();

        // empty object onto an array: type mismatch, replace
        s.set("edge", json!([1, 2]), None).unwrap();
        s.patch("edge", json!({})).unwrap();
        assert_eq!(s.get("edge").unwrap(), Some(json!({})));

        // empty object onto an object: override with no keys, unchanged
        s.set("edge", json!({"a": 1}), None).unwrap();
        s.patch("edge", json!({})).unwrap();
        assert_eq!(s.get("edge").unwrap(), Some(json!({"a": 1})));

        // empty array onto an object: type mismatch, replace
        s.set("edge", json!({"a": 1}), None).unwrap();
        s.patch("edge", json!([])).unwrap();
        assert_eq!(s.get("edge").unwrap(), Some(json!([])));

        // empty array onto an array: concat, unchanged
        s.set("edge", json!([1, 2]), None).unwrap();
        s.patch("edge", json!([])).unwrap();
        assert_eq!(s.get("edge").unwrap(), Some(json!([1, 2])));

        s.del("edge").unwrap();
    }

    #[test]
    #[ignore] // Only run when redis is available
    fn test_redis_ttl_expiry() {
        if !redis_available() {
            eprintln!("Skipping test: redis not available");
            return;
        }
        let s = RedisStore::connect(&test_config()).unwrap();
        s.set("short", json!(1), Some(1)).unwrap();
        assert_eq!(s.get("short").unwrap(), Some(json!(1)));
        std::thread::sleep(std::time::Duration::from_secs(2));
        assert_eq!(s.get("short").unwrap(), None);
    }
}
