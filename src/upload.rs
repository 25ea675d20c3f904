//! Durable upload manager.
//!
//! Persists chunk outputs and final artifacts to the primary
//! [`ObjectStore`] with a bounded number of concurrent transfers, separate
//! from conversion concurrency. Each artifact is addressed by a
//! [`ContentKey`] (SHA-256 of the bytes plus operation and slot identity),
//! and a key is transferred at most once: concurrent uploads of the same key
//! serialise on a per-key lock and later ones return the first receipt.
//!
//! Attempt `n` (0-based) runs under a timeout of
//! `min(attempt_timeout * 2^n, max_attempt_timeout)` and, when it fails,
//! waits `min(base_delay * 2^n, max_delay)` before the next one. When every
//! attempt fails the bytes go to the fallback store and the receipt is
//! flagged `degraded`; only a failing fallback surfaces as an error.

use crate::config::SchedulerConfig;
use crate::error::JobError;
use crate::model::OperationId;
use crate::retry::Backoff;
use crate::store::{ObjectRef, ObjectStore};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Which artifact of an operation is being persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactSlot {
    Chunk(u32),
    Final,
}

impl fmt::Display for ArtifactSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactSlot::Chunk(i) => write!(f, "chunk-{i}"),
            ArtifactSlot::Final => f.write_str("final"),
        }
    }
}

/// Content-addressed idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentKey(String);

impl ContentKey {
    pub fn derive(bytes: &[u8], operation: OperationId, slot: ArtifactSlot) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(operation.as_uuid().as_bytes());
        hasher.update(slot.to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(bytes);
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub key: ContentKey,
    pub reference: ObjectRef,
    /// `true` when the bytes live in the fallback store.
    pub degraded: bool,
    /// Primary attempts made; 0 for a deduplicated upload.
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadStats {
    pub transfers: u64,
    pub deduplicated: u64,
    pub fallbacks: u64,
    pub failures: u64,
}

#[derive(Default)]
struct Counters {
    transfers: AtomicU64,
    deduplicated: AtomicU64,
    fallbacks: AtomicU64,
    failures: AtomicU64,
}

pub struct DurableUploadManager {
    primary: Arc<dyn ObjectStore>,
    fallback: Arc<dyn ObjectStore>,
    permits: Semaphore,
    max_attempts: u32,
    delays: Backoff,
    attempt_timeouts: Backoff,
    receipts: DashMap<ContentKey, UploadReceipt>,
    key_locks: DashMap<ContentKey, Arc<Mutex<()>>>,
    counters: Counters,
}

impl DurableUploadManager {
    pub fn new(
        primary: Arc<dyn ObjectStore>,
        fallback: Arc<dyn ObjectStore>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            primary,
            fallback,
            permits: Semaphore::new(config.upload_concurrency.max(1)),
            max_attempts: config.upload_max_attempts.max(1),
            delays: Backoff::from_millis(config.upload_base_delay_ms, config.upload_max_delay_ms),
            attempt_timeouts: Backoff::from_millis(
                config.upload_attempt_timeout_ms,
                config.upload_max_attempt_timeout_ms,
            ),
            receipts: DashMap::new(),
            key_locks: DashMap::new(),
            counters: Counters::default(),
        }
    }

    /// Persist `bytes` under `key`, at most once per key.
    pub async fn upload(&self, bytes: Vec<u8>, key: ContentKey) -> Result<UploadReceipt, JobError> {
        if let Some(receipt) = self.existing(&key) {
            return Ok(receipt);
        }

        let lock = Arc::clone(
            self.key_locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        let _guard = lock.lock().await;
        if let Some(receipt) = self.existing(&key) {
            return Ok(receipt);
        }

        let result = self.transfer(&bytes, &key).await;
        if let Ok(receipt) = &result {
            self.receipts.insert(key.clone(), receipt.clone());
        }
        self.key_locks.remove(&key);
        result
    }

    fn existing(&self, key: &ContentKey) -> Option<UploadReceipt> {
        let receipt = self.receipts.get(key).map(|r| r.value().clone())?;
        self.counters.deduplicated.fetch_add(1, Ordering::Relaxed);
        debug!("upload {} already persisted as {}", key, receipt.reference);
        Some(UploadReceipt {
            attempts: 0,
            ..receipt
        })
    }

    async fn transfer(&self, bytes: &[u8], key: &ContentKey) -> Result<UploadReceipt, JobError> {
        let mut last_error = String::new();

        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                let delay = self.delays.delay(attempt - 1);
                warn!(
                    "upload {}: retry {}/{} after {:?}",
                    key,
                    attempt,
                    self.max_attempts - 1,
                    delay
                );
                sleep(delay).await;
            }

            let permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| JobError::Internal("upload semaphore closed".into()))?;
            let limit = self.attempt_timeouts.delay(attempt);
            self.counters.transfers.fetch_add(1, Ordering::Relaxed);
            let outcome = timeout(limit, self.primary.put(bytes.to_vec())).await;
            drop(permit);

            match outcome {
                Ok(Ok(reference)) => {
                    debug!("upload {} stored as {} (attempt {})", key, reference, attempt + 1);
                    return Ok(UploadReceipt {
                        key: key.clone(),
                        reference,
                        degraded: false,
                        attempts: attempt + 1,
                    });
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("attempt timed out after {limit:?}"),
            }
            warn!("upload {}: attempt {} failed: {}", key, attempt + 1, last_error);
        }

        match self.fallback.put(bytes.to_vec()).await {
            Ok(reference) => {
                self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "upload {}: primary store '{}' exhausted, degraded to '{}' as {}",
                    key,
                    self.primary.name(),
                    self.fallback.name(),
                    reference
                );
                Ok(UploadReceipt {
                    key: key.clone(),
                    reference,
                    degraded: true,
                    attempts: self.max_attempts,
                })
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                Err(JobError::UploadFailed {
                    key: key.to_string(),
                    attempts: self.max_attempts,
                    detail: format!("{last_error}; fallback: {e}"),
                })
            }
        }
    }

    /// Read back an artifact from whichever store holds it.
    pub async fn fetch(&self, reference: &ObjectRef, degraded: bool) -> Result<Vec<u8>, JobError> {
        if degraded {
            self.fallback.get(reference).await
        } else {
            self.primary.get(reference).await
        }
    }

    pub fn stats(&self) -> UploadStats {
        UploadStats {
            transfers: self.counters.transfers.load(Ordering::Relaxed),
            deduplicated: self.counters.deduplicated.load(Ordering::Relaxed),
            fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }
}
