//! In-memory state store with a timing-wheel sweeper.
//!
//! Entries live in a hash map guarded by one lock. TTL'd entries are also
//! registered in a fixed-size ring of expiry buckets keyed by
//! `expiry_second mod N`; a sweeper thread advances a cursor once per
//! second and processes every slot between its last position and the
//! current second, which tolerates clock jumps and missed ticks. Reads
//! always double-check expiry, so a wheel miss never leaks a stale value.

use super::{add_numeric, deep_merge, now_millis, Entry, StateStore, StoreError};
use crate::config::MemoryStoreConfig;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    default_ttl: Option<u64>,
    stop: Arc<AtomicBool>,
    sweeper: Mutex<Option<std::thread::JoinHandle<()>>>,
}

struct Inner {
    map: HashMap<String, Entry>,
    wheel: Vec<HashSet<String>>,
    /// Epoch second of the last processed slot.
    cursor: i64,
    /// Keys in insertion order, for FIFO eviction at capacity.
    insertion: VecDeque<String>,
    max_size: usize,
    closed: bool,
}

impl Inner {
    fn slot_of(&self, expires_at_ms: i64) -> usize {
        let secs = expires_at_ms.div_euclid(1000);
        secs.rem_euclid(self.wheel.len() as i64) as usize
    }

    fn unregister(&mut self, key: &str, prior_expiry: Option<i64>) {
        if let Some(at) = prior_expiry {
            let slot = self.slot_of(at);
            self.wheel[slot].remove(key);
        }
    }

    fn register(&mut self, key: &str, expiry: Option<i64>) {
        if let Some(at) = expiry {
            let slot = self.slot_of(at);
            self.wheel[slot].insert(key.to_string());
        }
    }

    /// Drop the entry if its expiry has passed. Returns true if removed.
    fn expire_if_due(&mut self, key: &str, now_ms: i64) -> bool {
        let due = match self.map.get(key) {
            Some(entry) => entry.is_expired(now_ms),
            None => false,
        };
        if due {
            if let Some(entry) = self.map.remove(key) {
                self.unregister(key, entry.expires_at);
            }
        }
        due
    }

    /// Evict the oldest-inserted keys until one slot is free.
    fn make_room(&mut self, incoming_key: &str) {
        while self.map.len() >= self.max_size {
            let victim = match self.insertion.pop_front() {
                Some(k) => k,
                None => return,
            };
            if victim == incoming_key || !self.map.contains_key(&victim) {
                continue;
            }
            if let Some(entry) = self.map.remove(&victim) {
                self.unregister(&victim, entry.expires_at);
            }
        }
    }

    /// Process every slot from the cursor up to `now_secs`, bounded by one
    /// full revolution.
    fn sweep(&mut self, now_secs: i64) {
        let slots = self.wheel.len() as i64;
        if self.cursor == 0 {
            self.cursor = now_secs - 1;
        }
        if now_secs <= self.cursor {
            return;
        }
        let span = (now_secs - self.cursor).min(slots);
        let now_ms = now_secs * 1000;
        for sec in (now_secs - span + 1)..=now_secs {
            let idx = sec.rem_euclid(slots) as usize;
            let candidates: Vec<String> = self.wheel[idx].iter().cloned().collect();
            for key in candidates {
                let expired = self
                    .map
                    .get(&key)
                    .map(|e| e.is_expired(now_ms))
                    .unwrap_or(true);
                if expired {
                    self.map.remove(&key);
                    self.wheel[idx].remove(&key);
                }
                // Entries from a future wheel revolution stay registered.
            }
        }
        self.cursor = now_secs;
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

impl MemoryStore {
    pub fn new(config: MemoryStoreConfig) -> Self {
        let slots = config.wheel_slots.max(2);
        let inner = Arc::new(Mutex::new(Inner {
            map: HashMap::new(),
            wheel: (0..slots).map(|_| HashSet::new()).collect(),
            cursor: 0,
            insertion: VecDeque::new(),
            max_size: config.max_size.max(1),
            closed: false,
        }));

        let stop = Arc::new(AtomicBool::new(false));
        let sweeper = {
            let inner = Arc::clone(&inner);
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("state-sweeper".into())
                .spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        std::thread::sleep(Duration::from_secs(1));
                        if stop.load(Ordering::Relaxed) {
                            break;
                        }
                        let now_secs = now_millis().div_euclid(1000);
                        inner.lock().sweep(now_secs);
                    }
                })
                .ok()
        };

        MemoryStore {
            inner,
            default_ttl: config.default_ttl,
            stop,
            sweeper: Mutex::new(sweeper),
        }
    }

    /// Advance the sweeper to the current second. Exposed for tests.
    #[cfg(test)]
    pub(crate) fn sweep_now(&self) {
        let now_secs = now_millis().div_euclid(1000);
        self.inner.lock().sweep(now_secs);
    }

    fn write_entry(
        &self,
        inner: &mut Inner,
        key: &str,
        entry: Entry,
        newly_inserted: bool,
    ) {
        if newly_inserted {
            inner.make_room(key);
            inner.insertion.push_back(key.to_string());
        }
        inner.register(key, entry.expires_at);
        inner.map.insert(key.to_string(), entry);
    }
}

impl StateStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        let now_ms = now_millis();
        if inner.expire_if_due(key, now_ms) {
            return Ok(None);
        }
        Ok(inner.map.get(key).map(|e| e.value.clone()))
    }

    fn set(&self, key: &str, value: Value, ttl: Option<u64>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        let ttl = ttl.or(self.default_ttl);
        let prior = inner.map.get(key).map(|e| (e.expires_at, e.created_at));
        if let Some((expiry, _)) = prior {
            inner.unregister(key, expiry);
        }
        let mut entry = Entry::new(value, ttl);
        if let Some((_, created_at)) = prior {
            entry.created_at = created_at;
        }
        self.write_entry(&mut inner, key, entry, prior.is_none());
        Ok(())
    }

    fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        if let Some(entry) = inner.map.remove(key) {
            inner.unregister(key, entry.expires_at);
        }
        Ok(())
    }

    fn increment(&self, key: &str, by: f64) -> Result<Value, StoreError> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        let now_ms = now_millis();
        inner.expire_if_due(key, now_ms);

        let prior = inner.map.get(key).cloned();
        let new_value = add_numeric(prior.as_ref().map(|e| &e.value), by);
        let entry = match prior {
            Some(mut e) => {
                e.value = new_value.clone();
                e.updated_at = now_ms;
                e
            }
            None => Entry::new(new_value.clone(), None),
        };
        let newly_inserted = !inner.map.contains_key(key);
        self.write_entry(&mut inner, key, entry, newly_inserted);
        Ok(new_value)
    }

    fn patch(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        let now_ms = now_millis();
        inner.expire_if_due(key, now_ms);

        let prior = inner.map.get(key).cloned();
        let merged = deep_merge(prior.as_ref().map(|e| &e.value), value);
        let entry = match prior {
            Some(mut e) => {
                e.value = merged;
                e.updated_at = now_ms;
                e
            }
            None => Entry::new(merged, None),
        };
        let newly_inserted = !inner.map.contains_key(key);
        self.write_entry(&mut inner, key, entry, newly_inserted);
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.sweeper.lock().take() {
            // The sweeper wakes once per second; detach rather than block.
            drop(handle);
        }
        self.inner.lock().closed = true;
        Ok(())
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}
