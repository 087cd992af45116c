use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rpl_core::{exponential_backoff, PipelineError};
use rpl_storage::LeaseStore;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

const LEASE_POLL_BASE: Duration = Duration::from_millis(25);
const LEASE_POLL_MAX: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lease store error for {key}: {message}")]
    Store { key: String, message: String },
}

impl From<LockError> for PipelineError {
    fn from(e: LockError) -> Self {
        PipelineError::Storage(e.to_string())
    }
}

/// Named locks shared by concurrent runs.
/// Keys: `namespace:<ns>` around verify+apply+record, `signing-key:<key_id>` around sign.
///
/// Runs in one process queue on an async mutex per key. With a [`LeaseStore`]
/// attached, the holder also takes a lease in that store, which excludes other
/// processes sharing the database. Waiting is unbounded; callers put the
/// acquisition inside the step's timeout.
#[derive(Default)]
pub struct LockRegistry {
    locks: DashMap<String, Arc<Mutex<()>>>,
    leases: Option<Leases>,
}

struct Leases {
    store: Arc<dyn LeaseStore>,
    holder: String,
    ttl: Duration,
}

/// Held while the named lock is owned. Dropping it releases the lease, then the local mutex.
pub struct LockGuard {
    lease: Option<(Arc<dyn LeaseStore>, String, String)>,
    _local: OwnedMutexGuard<()>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some((store, key, holder)) = self.lease.take() {
            if let Err(e) = store.release_lease(&key, &holder) {
                warn!(key, "failed to release lease: {e:#}");
            }
        }
    }
}

impl LockRegistry {
    /// Process-local locks only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks that also exclude other processes using `store`. `ttl` bounds how long a
    /// crashed holder can block others and must exceed the longest locked step.
    pub fn with_leases(store: Arc<dyn LeaseStore>, ttl: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            leases: Some(Leases {
                store,
                holder: uuid::Uuid::new_v4().to_string(),
                ttl,
            }),
        }
    }

    pub async fn acquire(&self, key: &str) -> Result<LockGuard, LockError> {
        // Clone the Arc out so the shard guard is released before awaiting.
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        debug!(key, "waiting for lock");
        let local = lock.lock_owned().await;

        let Some(leases) = &self.leases else {
            return Ok(LockGuard {
                lease: None,
                _local: local,
            });
        };
        let ttl_ms = leases.ttl.as_millis() as i64;
        let mut attempt = 0;
        loop {
            let taken = leases
                .store
                .try_acquire_lease(key, &leases.holder, ttl_ms)
                .map_err(|e| LockError::Store {
                    key: key.to_string(),
                    message: format!("{e:#}"),
                })?;
            if taken {
                return Ok(LockGuard {
                    lease: Some((leases.store.clone(), key.to_string(), leases.holder.clone())),
                    _local: local,
                });
            }
            attempt += 1;
            if attempt == 1 {
                debug!(key, "lease held by another process, waiting");
            }
            tokio::time::sleep(exponential_backoff(attempt, LEASE_POLL_BASE, LEASE_POLL_MAX)).await;
        }
    }

    pub fn namespace_key(namespace: &str) -> String {
        format!("namespace:{namespace}")
    }

    pub fn signing_key(key_id: &str) -> String {
        format!("signing-key:{key_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpl_storage::InMemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn same_key_serializes() {
        let locks = Arc::new(LockRegistry::new());
        let active = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let mut handles = vec![];
        for _ in 0..4 {
            let (locks, active, peak) = (locks.clone(), active.clone(), peak.clone());
            handles.push(tokio::spawn(async move {
                let _g = locks.acquire(&LockRegistry::namespace_key("prod")).await.unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = LockRegistry::new();
        let _a = locks.acquire("namespace:dev").await.unwrap();
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("namespace:prod")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn registries_sharing_a_lease_store_exclude_each_other() {
        let store: Arc<dyn LeaseStore> = Arc::new(InMemoryStore::new());
        let active = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let mut handles = vec![];
        for _ in 0..3 {
            // One registry per task stands in for one process each.
            let locks = LockRegistry::with_leases(store.clone(), Duration::from_secs(30));
            let (active, peak) = (active.clone(), peak.clone());
            handles.push(tokio::spawn(async move {
                let _g = locks.acquire(&LockRegistry::namespace_key("prod")).await.unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropping_the_guard_releases_the_lease() {
        let store = Arc::new(InMemoryStore::new());
        let locks = LockRegistry::with_leases(store.clone(), Duration::from_secs(30));
        let guard = locks.acquire("signing-key:k1").await.unwrap();
        assert!(!store.try_acquire_lease("signing-key:k1", "other", 1_000).unwrap());
        drop(guard);
        assert!(store.try_acquire_lease("signing-key:k1", "other", 1_000).unwrap());
    }
}
