//! Shared configuration key/value store
//!
//! In-memory ordered store with directory semantics and blocking gets.
//! Keys are normalized before use; the ordered map makes directory scans a
//! single range walk. The store owns its own lock, separate from the
//! cluster state, and the two are never held at the same time.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{CoordinationError, Result};

/// One entry of a directory scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValueEntry {
    pub key: String,
    pub value: String,
}

/// Collapse runs of `/` and strip leading/trailing `/`.
///
/// `///a//b/c//` becomes `a/b/c`.
pub fn normalize_key(key: &str) -> String {
    key.split('/')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

#[derive(Default)]
struct KvInner {
    entries: BTreeMap<String, String>,
    waiters: HashMap<String, Vec<oneshot::Sender<Result<String>>>>,
}

/// In-memory ordered key/value store with per-key blocking gets
pub struct KvStore {
    inner: Mutex<KvInner>,
}

impl KvStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(KvInner::default()),
        }
    }

    /// Write a key, draining any gets blocked on it
    ///
    /// With `allow_overwrite` unset, writing an existing key fails with
    /// `AlreadyExists`. Waiters are released in enqueue order.
    pub fn insert(&self, key: &str, value: &str, allow_overwrite: bool) -> Result<()> {
        let norm_key = normalize_key(key);
        let mut inner = self.inner.lock();
        if !allow_overwrite && inner.entries.contains_key(&norm_key) {
            return Err(CoordinationError::already_exists(format!(
                "config key {key} already exists"
            )));
        }
        debug!(key = %norm_key, allow_overwrite, "insert key-value");
        inner.entries.insert(norm_key.clone(), value.to_string());
        if let Some(waiters) = inner.waiters.remove(&norm_key) {
            for waiter in waiters {
                let _ = waiter.send(Ok(value.to_string()));
            }
        }
        Ok(())
    }

    /// Get a value, waiting until some task inserts the key
    pub async fn get(&self, key: &str) -> Result<String> {
        let norm_key = normalize_key(key);
        let pending = {
            let mut inner = self.inner.lock();
            if let Some(value) = inner.entries.get(&norm_key) {
                return Ok(value.clone());
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.entry(norm_key).or_default().push(tx);
            rx
        };
        pending
            .await
            .unwrap_or_else(|_| Err(CoordinationError::cancelled("key-value store dropped the request")))
    }

    /// Non-blocking get
    pub fn try_get(&self, key: &str) -> Result<String> {
        let norm_key = normalize_key(key);
        let inner = self.inner.lock();
        inner
            .entries
            .get(&norm_key)
            .cloned()
            .ok_or_else(|| CoordinationError::not_found(format!("config key {key} not found")))
    }

    /// All entries directly or transitively under `<directory_key>/`
    ///
    /// Entries come back in lexicographic key order.
    pub fn get_dir(&self, directory_key: &str) -> Vec<KeyValueEntry> {
        let dir = format!("{}/", normalize_key(directory_key));
        let inner = self.inner.lock();
        inner
            .entries
            .range(dir.clone()..)
            .take_while(|(key, _)| key.starts_with(&dir))
            .map(|(key, value)| KeyValueEntry {
                key: key.clone(),
                value: value.clone(),
            })
            .collect()
    }

    /// Erase a key and the entire subtree under `<key>/`
    pub fn delete(&self, key: &str) -> Result<()> {
        let norm_key = normalize_key(key);
        let dir = format!("{norm_key}/");
        let mut inner = self.inner.lock();
        let subtree: Vec<String> = inner
            .entries
            .range(dir.clone()..)
            .take_while(|(key, _)| key.starts_with(&dir))
            .map(|(key, _)| key.clone())
            .collect();
        for key in subtree {
            inner.entries.remove(&key);
        }
        inner.entries.remove(&norm_key);
        Ok(())
    }

    /// Cancel every pending blocking get; called on service stop
    pub fn cancel_all_pending(&self) {
        let waiters = std::mem::take(&mut self.inner.lock().waiters);
        for (key, list) in waiters {
            for waiter in list {
                let _ = waiter.send(Err(CoordinationError::cancelled(format!(
                    "coordination service is shutting down; cancelling GetKeyValue for key {key}"
                ))));
            }
        }
    }
}

impl Default for KvStore {
    fn default() -> Self {
        Self::new()
    }
}
