//! Object-store-backed distributed lock.
//!
//! Rollout and uninstall of the same release are serialized across processes
//! through an advisory lock object. Acquisition relies on the store's
//! create-if-absent semantics; a holder that dies leaves a lock document
//! whose TTL lets the next acquirer take over.

use crate::error::{EngineError, Result};
use crate::storage::RemoteStorage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const LOCK_TTL_SECS: i64 = 3600;
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Contents of the lock object.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockDocument {
    holder: String,
    acquired_at: DateTime<Utc>,
    ttl_seconds: i64,
}

impl LockDocument {
    fn is_expired(&self) -> bool {
        Utc::now()
            .signed_duration_since(self.acquired_at)
            .num_seconds()
            > self.ttl_seconds
    }
}

/// Detects the identity recorded as the lock holder.
///
/// Priority: `POD_NAME` → `HOSTNAME` → random suffix.
fn detect_identity() -> String {
    std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("engine-{:08x}", rand::random::<u32>()))
}

/// Advisory mutual exclusion keyed by a storage URL.
pub struct DistributedLock {
    storage: Arc<dyn RemoteStorage>,
    url: String,
    identity: String,
    held: std::sync::atomic::AtomicBool,
}

impl DistributedLock {
    pub fn with_url(storage: Arc<dyn RemoteStorage>, url: &str) -> Self {
        let identity = detect_identity();
        debug!(identity = %identity, url = %url, "initialized distributed lock");
        Self {
            storage,
            url: url.to_string(),
            identity,
            held: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Blocks until the lock is acquired or `timeout` elapses.
    pub async fn lock(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        info!(url = %self.url, "waiting to acquire lock");
        loop {
            match self.try_acquire().await {
                Ok(true) => {
                    self.held.store(true, std::sync::atomic::Ordering::SeqCst);
                    info!(url = %self.url, "acquired lock");
                    return Ok(());
                }
                Ok(false) => {
                    debug!(url = %self.url, "lock held by another instance, retrying");
                }
                Err(e) => {
                    warn!(url = %self.url, "lock acquisition error: {}, retrying", e);
                }
            }
            if tokio::time::Instant::now() + RETRY_INTERVAL > deadline {
                return Err(EngineError::LockTimeout(self.url.clone()));
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    /// Releases the lock. Releasing a lock we do not hold is a no-op.
    pub async fn unlock(&self) -> Result<()> {
        if !self.held.swap(false, std::sync::atomic::Ordering::SeqCst) {
            return Ok(());
        }
        match self.read_document().await {
            Ok(Some(doc)) if doc.holder == self.identity => {
                self.storage.delete(&self.url).await?;
                info!(url = %self.url, "released lock");
            }
            Ok(_) => {
                debug!(url = %self.url, "lock not held by us, skipping release");
            }
            Err(e) => {
                warn!(url = %self.url, "failed to read lock for release: {}", e);
            }
        }
        Ok(())
    }

    async fn try_acquire(&self) -> Result<bool> {
        let doc = LockDocument {
            holder: self.identity.clone(),
            acquired_at: Utc::now(),
            ttl_seconds: LOCK_TTL_SECS,
        };
        let body = serde_yaml::to_string(&doc)?.into_bytes();
        if self.storage.put_if_absent(&self.url, body.clone()).await? {
            return Ok(true);
        }
        // Lock object exists: take over only when the previous holder let
        // its TTL lapse.
        match self.read_document().await? {
            Some(existing) if existing.holder == self.identity => Ok(true),
            Some(existing) if existing.is_expired() => {
                warn!(
                    url = %self.url,
                    holder = %existing.holder,
                    "taking over expired lock"
                );
                self.storage.delete(&self.url).await?;
                self.storage.put_if_absent(&self.url, body).await
            }
            Some(_) => Ok(false),
            // Raced with a release between the failed create and the read.
            None => Ok(false),
        }
    }

    async fn read_document(&self) -> Result<Option<LockDocument>> {
        match self.storage.read(&self.url).await {
            Ok(bytes) => {
                let doc = serde_yaml::from_slice(&bytes)?;
                Ok(Some(doc))
            }
            Err(EngineError::Storage(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
