//! Append-log file state store with snapshot compaction.
//!
//! The in-process map mirrors two files on disk: `<base>.snapshot`
//! (newline-delimited `{key, entry}` records) and `<base>.log`
//! (newline-delimited mutation records). Every mutation appends one log
//! record and syncs. Reads never touch the disk. Compaction writes a fresh
//! snapshot to a temp file, renames it over the live snapshot atomically,
//! then truncates the log. Startup loads the snapshot and replays the log
//! in order, skipping entries whose computed absolute expiry has passed.

use super::{add_numeric, deep_merge, now_millis, Entry, StateStore, StoreError};
use crate::config::FileStoreConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum LogOp {
    Set,
    Del,
    Increment,
    Patch,
}

/// One mutation in the append log. `value` holds the written value for
/// `set`/`patch` and the addend for `increment`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogRecord {
    timestamp: i64,
    operation: LogOp,
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ttl: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotRecord {
    key: String,
    entry: Entry,
}

pub struct FileStore {
    inner: Arc<Mutex<Inner>>,
    snapshot_on_shutdown: bool,
    stop: Arc<AtomicBool>,
    compactor: Mutex<Option<std::thread::JoinHandle<()>>>,
}

struct Inner {
    map: HashMap<String, Entry>,
    log: Option<File>,
    log_path: PathBuf,
    snapshot_path: PathBuf,
}

impl Inner {
    fn append(&mut self, record: &LogRecord) -> Result<(), StoreError> {
        let log = self.log.as_mut().ok_or(StoreError::Closed)?;
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        log.write_all(line.as_bytes())?;
        log.sync_data()?;
        Ok(())
    }

    /// Write a fresh snapshot next to the live one and swap it in, then
    /// truncate the log.
    fn compact(&mut self) -> Result<(), StoreError> {
        if self.log.is_none() {
            return Err(StoreError::Closed);
        }
        let now_ms = now_millis();
        let tmp_path = self.snapshot_path.with_extension("snapshot.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            for (key, entry) in &self.map {
                if entry.is_expired(now_ms) {
                    continue;
                }
                let record = SnapshotRecord {
                    key: key.clone(),
                    entry: entry.clone(),
                };
                let mut line = serde_json::to_string(&record)?;
                line.push('\n');
                tmp.write_all(line.as_bytes())?;
            }
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.snapshot_path)?;

        let log = self.log.as_mut().ok_or(StoreError::Closed)?;
        log.set_len(0)?;
        log.seek(SeekFrom::Start(0))?;
        log.sync_all()?;
        Ok(())
    }
}

impl FileStore {
    pub fn open(config: FileStoreConfig) -> Result<Self, StoreError> {
        let base = &config.path;
        if let Some(parent) = base.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let log_path = with_suffix(base, "log");
        let snapshot_path = with_suffix(base, "snapshot");

        let mut map = HashMap::new();
        load_snapshot(&snapshot_path, &mut map)?;
        replay_log(&log_path, &mut map)?;

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let inner = Arc::new(Mutex::new(Inner {
            map,
            log: Some(log),
            log_path,
            snapshot_path,
        }));

        let stop = Arc::new(AtomicBool::new(false));
        let compactor = config.compaction_interval.and_then(|interval_secs| {
            let inner = Arc::clone(&inner);
            let stop = Arc::clone(&stop);
            let interval = Duration::from_secs(interval_secs.max(1));
            std::thread::Builder::new()
                .name("state-compactor".into())
                .spawn(move || {
                    let tick = Duration::from_millis(250);
                    let mut elapsed = Duration::ZERO;
                    while !stop.load(Ordering::Relaxed) {
                        std::thread::sleep(tick);
                        elapsed += tick;
                        if elapsed < interval {
                            continue;
                        }
                        elapsed = Duration::ZERO;
                        if let Err(e) = inner.lock().compact() {
                            if !matches!(e, StoreError::Closed) {
                                tracing::warn!(error = %e, "state log compaction failed");
                            }
                        }
                    }
                })
                .ok()
        });

        Ok(FileStore {
            inner,
            snapshot_on_shutdown: config.snapshot_on_shutdown,
            stop,
            compactor: Mutex::new(compactor),
        })
    }

    /// Force a compaction pass. Exposed for tests and shutdown paths.
    pub fn compact(&self) -> Result<(), StoreError> {
        self.inner.lock().compact()
    }
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    name.push('.');
    name.push_str(suffix);
    base.with_file_name(name)
}

fn load_snapshot(path: &Path, map: &mut HashMap<String, Entry>) -> Result<(), StoreError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let now_ms = now_millis();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: SnapshotRecord = serde_json::from_str(&line)?;
        if record.entry.is_expired(now_ms) {
            continue;
        }
        map.insert(record.key, record.entry);
    }
    Ok(())
}

fn replay_log(path: &Path, map: &mut HashMap<String, Entry>) -> Result<(), StoreError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let now_ms = now_millis();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: LogRecord = serde_json::from_str(&line)?;
        apply_record(map, record, now_ms);
    }
    Ok(())
}

fn apply_record(map: &mut HashMap<String, Entry>, record: LogRecord, now_ms: i64) {
    match record.operation {
        LogOp::Set => {
            let value = record.value.unwrap_or(Value::Null);
            let expires_at = record.ttl.map(|t| record.timestamp + (t as i64) * 1000);
            if matches!(expires_at, Some(at) if at <= now_ms) {
                map.remove(&record.key);
                return;
            }
            let created_at = map
                .get(&record.key)
                .map(|e| e.created_at)
                .unwrap_or(record.timestamp);
            map.insert(
                record.key,
                Entry {
                    value,
                    expires_at,
                    created_at,
                    updated_at: record.timestamp,
                },
            );
        }
        LogOp::Del => {
            map.remove(&record.key);
        }
        LogOp::Increment => {
            let by = record.value.as_ref().and_then(Value::as_f64).unwrap_or(1.0);
            let prior = map.get(&record.key).filter(|e| !e.is_expired(now_ms));
            let new_value = add_numeric(prior.map(|e| &e.value), by);
            let entry = match map.get(&record.key) {
                Some(e) if !e.is_expired(now_ms) => Entry {
                    value: new_value,
                    expires_at: e.expires_at,
                    created_at: e.created_at,
                    updated_at: record.timestamp,
                },
                _ => Entry {
                    value: new_value,
                    expires_at: None,
                    created_at: record.timestamp,
                    updated_at: record.timestamp,
                },
            };
            map.insert(record.key, entry);
        }
        LogOp::Patch => {
            let incoming = record.value.unwrap_or(Value::Null);
            let prior = map.get(&record.key).filter(|e| !e.is_expired(now_ms));
            let merged = deep_merge(prior.map(|e| &e.value), incoming);
            let entry = match map.get(&record.key) {
                Some(e) if !e.is_expired(now_ms) => Entry {
                    value: merged,
                    expires_at: e.expires_at,
                    created_at: e.created_at,
                    updated_at: record.timestamp,
                },
                _ => Entry {
                    value: merged,
                    expires_at: None,
                    created_at: record.timestamp,
                    updated_at: record.timestamp,
                },
            };
            map.insert(record.key, entry);
        }
    }
}

impl StateStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let inner = self.inner.lock();
        if inner.log.is_none() {
            return Err(StoreError::Closed);
        }
        let now_ms = now_millis();
        match inner.map.get(key) {
            Some(entry) if !entry.is_expired(now_ms) => Ok(Some(entry.value.clone())),
            _ => Ok(None),
        }
    }

    fn set(&self, key: &str, value: Value, ttl: Option<u64>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let record = LogRecord {
            timestamp: now_millis(),
            operation: LogOp::Set,
            key: key.to_string(),
            value: Some(value.clone()),
            ttl,
        };
        inner.append(&record)?;
        let created_at = inner.map.get(key).map(|e| e.created_at);
        let mut entry = Entry::new(value, ttl);
        if let Some(created) = created_at {
            entry.created_at = created;
        }
        inner.map.insert(key.to_string(), entry);
        Ok(())
    }

    fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let record = LogRecord {
            timestamp: now_millis(),
            operation: LogOp::Del,
            key: key.to_string(),
            value: None,
            ttl: None,
        };
        inner.append(&record)?;
        inner.map.remove(key);
        Ok(())
    }

    fn increment(&self, key: &str, by: f64) -> Result<Value, StoreError> {
        let mut inner = self.inner.lock();
        let now_ms = now_millis();
        let record = LogRecord {
            timestamp: now_ms,
            operation: LogOp::Increment,
            key: key.to_string(),
            value: Some(super::number_value(by)),
            ttl: None,
        };
        inner.append(&record)?;

        let prior = inner.map.get(key).filter(|e| !e.is_expired(now_ms)).cloned();
        let new_value = add_numeric(prior.as_ref().map(|e| &e.value), by);
        let entry = match prior {
            Some(mut e) => {
                e.value = new_value.clone();
                e.updated_at = now_ms;
                e
            }
            None => Entry::new(new_value.clone(), None),
        };
        inner.map.insert(key.to_string(), entry);
        Ok(new_value)
    }

    fn patch(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let now_ms = now_millis();
        let record = LogRecord {
            timestamp: now_ms,
            operation: LogOp::Patch,
            key: key.to_string(),
            value: Some(value.clone()),
            ttl: None,
        };
        inner.append(&record)?;

        let prior = inner.map.get(key).filter(|e| !e.is_expired(now_ms)).cloned();
        let merged = deep_merge(prior.as_ref().map(|e| &e.value), value);
        let entry = match prior {
            Some(mut e) => {
                e.value = merged;
                e.updated_at = now_ms;
                e
            }
            None => Entry::new(merged, None),
        };
        inner.map.insert(key.to_string(), entry);
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.compactor.lock().take() {
            let _ = handle.join();
        }
        let mut inner = self.inner.lock();
        if inner.log.is_none() {
            return Ok(());
        }
        if self.snapshot_on_shutdown {
            inner.compact()?;
        }
        if let Some(log) = inner.log.as_mut() {
            log.sync_all()?;
        }
        inner.log = None;
        Ok(())
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open_at(dir: &Path) -> FileStore {
        FileStore::open(FileStoreConfig {
            path: dir.join("state"),
            compaction_interval: None,
            snapshot_on_shutdown: true,
        })
        .unwrap()
    }

    #[test]
    fn test_set_get_del() {
        let dir = tempfile::tempdir().unwrap();
        let s = open_at(dir.path());
        s.set("k", json!({"a": 1}), None).unwrap();
        assert_eq!(s.get("k").unwrap(), Some(json!({"a": 1})));
        s.del("k").unwrap();
        assert_eq!(s.get("k").unwrap(), None);
    }

    #[test]
    fn test_restart_replays_log() {
        let dir = tempfile::tempdir().unwrap();
        {
            let s = open_at(dir.path());
            s.set("user", json!({"name": "Ada"}), None).unwrap();
            s.increment("count", 2.0).unwrap();
            s.patch("user", json!({"age": 36})).unwrap();
            s.set("gone", json!(1), None).unwrap();
            s.del("gone").unwrap();
            // dropped without close(): recovery must come from the log
        }
        let s = open_at(dir.path());
        assert_eq!(
            s.get("user").unwrap(),
            Some(json!({"name": "Ada", "age": 36}))
        );
        assert_eq!(s.get("count").unwrap(), Some(json!(2)));
        assert_eq!(s.get("gone").unwrap(), None);
    }

    #[test]
    fn test_restart_skips_expired_entries() {
        let dir = tempfile::tempdir().unwrap();
        {
            let s = open_at(dir.path());
            s.set("short", json!(1), Some(1)).unwrap();
            s.set("long", json!(2), Some(3600)).unwrap();
        }
        std::thread::sleep(Duration::from_millis(1_100));
        let s = open_at(dir.path());
        assert_eq!(s.get("short").unwrap(), None);
        assert_eq!(s.get("long").unwrap(), Some(json!(2)));
    }

    #[test]
    fn test_compaction_truncates_log_and_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("state.log");
        {
            let s = open_at(dir.path());
            for i in 0..20 {
                s.set("k", json!(i), None).unwrap();
            }
            assert!(std::fs::metadata(&log_path).unwrap().len() > 0);
            s.compact().unwrap();
            assert_eq!(std::fs::metadata(&log_path).unwrap().len(), 0);
        }
        let s = open_at(dir.path());
        assert_eq!(s.get("k").unwrap(), Some(json!(19)));
    }

    #[test]
    fn test_close_snapshots_and_rejects_further_ops() {
        let dir = tempfile::tempdir().unwrap();
        let s = open_at(dir.path());
        s.set("k", json!("v"), None).unwrap();
        s.close().unwrap();
        assert!(matches!(s.get("k"), Err(StoreError::Closed)));
        assert!(std::fs::metadata(dir.path().join("state.snapshot")).is_ok());
    }

    #[test]
    fn test_snapshot_plus_log_recovery_order() {
        let dir = tempfile::tempdir().unwrap();
        {
            let s = open_at(dir.path());
            s.set("k", json!("snapshotted"), None).unwrap();
            s.compact().unwrap();
            s.set("k", json!("from-log"), None).unwrap();
        }
        let s = open_at(dir.path());
        // the log entry is newer than the snapshot
        assert_eq!(s.get("k").unwrap(), Some(json!("from-log")));
    }
}
