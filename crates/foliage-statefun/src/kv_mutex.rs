// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Renewable single-writer lock over a key/value bucket key.
//!
//! The sentinel is a timestamped JSON entry. A lock is won either by
//! creating the key, or by a compare-and-swap over a sentinel older than the
//! configured lifetime. Holders refresh via [`KeyMutex::lock_update`]; the
//! runtime runs a refresher loop at half the lifetime.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use foliage_substrate::{KeyValueStore, SubstrateError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Errors from mutex operations.
#[derive(Debug, Error)]
pub enum MutexError {
    /// Non-blocking acquisition found a live holder.
    #[error("key '{0}' is already locked")]
    AlreadyLocked(String),

    /// A refresh or unlock lost the compare-and-swap race: the lock was
    /// taken over by another holder.
    #[error("lock on key '{0}' was lost")]
    LostLock(String),

    /// Substrate failure underneath the lock.
    #[error("substrate error: {0}")]
    Substrate(#[from] SubstrateError),

    /// The sentinel could not be parsed.
    #[error("malformed lock sentinel at key '{0}'")]
    MalformedSentinel(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct Sentinel {
    locked_at: i64,
}

impl Sentinel {
    fn now() -> Self {
        Self {
            locked_at: chrono::Utc::now()
                .timestamp_nanos_opt()
                .unwrap_or(i64::MAX),
        }
    }

    fn age(&self) -> Duration {
        let now = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or(i64::MAX);
        Duration::from_nanos(now.saturating_sub(self.locked_at).max(0) as u64)
    }

    fn to_bytes(&self) -> Bytes {
        Bytes::from(serde_json::to_vec(self).expect("sentinel serializes"))
    }
}

/// Handle over the bucket used for locking.
#[derive(Clone)]
pub struct KeyMutex {
    kv: Arc<dyn KeyValueStore>,
    life_time: Duration,
    poll_interval: Duration,
}

impl KeyMutex {
    /// Build a mutex helper over a bucket.
    pub fn new(kv: Arc<dyn KeyValueStore>, life_time: Duration, poll_interval: Duration) -> Self {
        Self {
            kv,
            life_time,
            poll_interval,
        }
    }

    /// Acquire the lock on `key`. Returns the held revision.
    ///
    /// When `blocking`, retries every poll interval until the lock is won;
    /// otherwise a live holder yields [`MutexError::AlreadyLocked`].
    pub async fn lock(&self, key: &str, blocking: bool) -> Result<u64, MutexError> {
        loop {
            match self.try_lock(key).await {
                Ok(revision) => {
                    debug!(key, revision, "kv mutex acquired");
                    return Ok(revision);
                }
                Err(MutexError::AlreadyLocked(_)) if blocking => {
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Refresh the sentinel timestamp. Returns the new held revision.
    pub async fn lock_update(&self, key: &str, held_revision: u64) -> Result<u64, MutexError> {
        match self
            .kv
            .update(key, Sentinel::now().to_bytes(), held_revision)
            .await
        {
            Ok(revision) => Ok(revision),
            Err(SubstrateError::RevisionMismatch(_)) | Err(SubstrateError::KeyNotFound(_)) => {
                Err(MutexError::LostLock(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Release the lock via compare-and-swap delete.
    pub async fn unlock(&self, key: &str, held_revision: u64) -> Result<(), MutexError> {
        match self.kv.delete_revision(key, held_revision).await {
            Ok(()) => Ok(()),
            Err(SubstrateError::RevisionMismatch(_)) | Err(SubstrateError::KeyNotFound(_)) => {
                Err(MutexError::LostLock(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn try_lock(&self, key: &str) -> Result<u64, MutexError> {
        match self.kv.get(key).await? {
            None => match self.kv.create(key, Sentinel::now().to_bytes()).await {
                Ok(revision) => Ok(revision),
                // Lost the creation race to another process.
                Err(SubstrateError::KeyAlreadyExists(_)) => {
                    Err(MutexError::AlreadyLocked(key.to_string()))
                }
                Err(err) => Err(err.into()),
            },
            Some(entry) => {
                let sentinel: Sentinel = serde_json::from_slice(&entry.value)
                    .map_err(|_| MutexError::MalformedSentinel(key.to_string()))?;
                if sentinel.age() <= self.life_time {
                    return Err(MutexError::AlreadyLocked(key.to_string()));
                }
                // Stale holder: race for the takeover.
                match self
                    .kv
                    .update(key, Sentinel::now().to_bytes(), entry.revision)
                    .await
                {
                    Ok(revision) => Ok(revision),
                    Err(SubstrateError::RevisionMismatch(_)) => {
                        Err(MutexError::AlreadyLocked(key.to_string()))
                    }
                    Err(err) => Err(err.into()),
                }
            }
        }
    }
}
