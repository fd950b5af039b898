// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-local read-through cache over the key/value bucket.
//!
//! Reads miss through to the bucket and populate the local index; writes go
//! to the bucket first and then update the local entry with the returned
//! revision. A watcher task applies external mutations, so pattern queries
//! are served entirely from the local index. Within one process the cache is
//! read-your-writes; across processes it converges with watcher latency.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use foliage_substrate::{KeyValueStore, KvEvent, SubstrateError};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::Result;
use foliage_substrate::subject;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Bytes,
    revision: u64,
}

/// Local mirror of the runtime's key/value bucket.
pub struct CacheStore {
    kv: Arc<dyn KeyValueStore>,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl CacheStore {
    /// Load the bucket snapshot and start the watcher task.
    pub async fn start(kv: Arc<dyn KeyValueStore>) -> Result<Arc<Self>> {
        let watch = kv.watch().await?;
        let mut entries = HashMap::new();
        for (key, entry) in watch.entries {
            entries.insert(
                key,
                CacheEntry {
                    value: entry.value,
                    revision: entry.revision,
                },
            );
        }
        debug!(entries = entries.len(), "cache store loaded");

        let store = Arc::new(Self {
            kv,
            entries: RwLock::new(entries),
        });
        tokio::spawn(run_watcher(Arc::downgrade(&store), watch.events));
        Ok(store)
    }

    /// Read a key, missing through to the bucket.
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        if let Some(entry) = self.entries.read().expect("cache lock").get(key) {
            return Ok(Some(entry.value.clone()));
        }
        match self.kv.get(key).await? {
            Some(found) => {
                self.apply(key, Some(found.value.clone()), found.revision);
                Ok(Some(found.value))
            }
            None => Ok(None),
        }
    }

    /// Read a key as JSON.
    pub async fn get_json(&self, key: &str) -> Result<Option<Value>> {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Write a key. Returns the new revision.
    pub async fn set(&self, key: &str, value: Bytes) -> Result<u64> {
        let revision = self.kv.put(key, value.clone()).await?;
        self.apply(key, Some(value), revision);
        Ok(revision)
    }

    /// Write a key as JSON.
    pub async fn set_json(&self, key: &str, value: &Value) -> Result<u64> {
        self.set(key, Bytes::from(serde_json::to_vec(value)?)).await
    }

    /// Compare-and-swap write against a known revision.
    pub async fn compare_and_set(&self, key: &str, value: Bytes, revision: u64) -> Result<u64> {
        match self.kv.update(key, value.clone(), revision).await {
            Ok(new_revision) => {
                self.apply(key, Some(value), new_revision);
                Ok(new_revision)
            }
            Err(err @ SubstrateError::RevisionMismatch(_)) => {
                // Local entry is stale: drop it so the next read re-fetches.
                self.entries.write().expect("cache lock").remove(key);
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Delete a key.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.kv.delete(key).await?;
        self.entries.write().expect("cache lock").remove(key);
        Ok(())
    }

    /// Keys matching a `.`-segmented pattern, served from the local index.
    pub fn get_keys_by_pattern(&self, pattern: &str) -> Vec<String> {
        let entries = self.entries.read().expect("cache lock");
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| subject::matches(pattern, k))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Revision of a locally-known key.
    pub fn revision(&self, key: &str) -> Option<u64> {
        self.entries
            .read()
            .expect("cache lock")
            .get(key)
            .map(|e| e.revision)
    }

    fn apply(&self, key: &str, value: Option<Bytes>, revision: u64) {
        let mut entries = self.entries.write().expect("cache lock");
        match entries.get(key) {
            Some(existing) if existing.revision >= revision => {}
            _ => match value {
                Some(value) => {
                    entries.insert(key.to_string(), CacheEntry { value, revision });
                }
                None => {
                    entries.remove(key);
                }
            },
        }
    }
}

async fn run_watcher(store: std::sync::Weak<CacheStore>, mut events: broadcast::Receiver<KvEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let Some(store) = store.upgrade() else { return };
                store.apply(&event.key, event.value, event.revision);
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "cache watcher lagged behind bucket events");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
