// ----------------------------------------------------------------------------
// 9.5 In-Memory Lease Store
// ----------------------------------------------------------------------------
// Process-local store with TTL leases. Used by tests and by binaries built
// without the `etcd` feature. Expired leases are purged lazily on read.
// ----------------------------------------------------------------------------

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::{KeepAliveStream, LeaseId, LeaseStore};
use crate::error::{RegistryError, RegistryResult};

#[derive(Debug)]
struct Entry {
    value: String,
    lease: LeaseId,
}

#[derive(Debug)]
struct Lease {
    ttl: Duration,
    deadline: Instant,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct Inner {
    kv: DashMap<String, Entry>,
    leases: DashMap<LeaseId, Lease>,
    next_id: AtomicI64,
    available: AtomicBool,
}

/// In-memory [`LeaseStore`].
#[derive(Debug, Clone)]
pub struct MemoryLeaseStore {
    inner: Arc<Inner>,
}

impl Default for MemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                kv: DashMap::new(),
                leases: DashMap::new(),
                next_id: AtomicI64::new(1),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Simulate an outage. Going offline ends every keep-alive stream.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, AtomicOrdering::SeqCst);
        if !available {
            for lease in self.inner.leases.iter() {
                lease.cancel.cancel();
            }
        }
    }

    /// Drop a lease as if its TTL ran out.
    pub fn expire_lease(&self, lease: LeaseId) -> bool {
        self.inner.remove_lease(lease)
    }

    pub fn lease_count(&self) -> usize {
        self.inner.purge_expired();
        self.inner.leases.len()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.purge_expired();
        self.inner.kv.get(key).map(|e| e.value.clone())
    }

    fn check(&self, endpoint: &str) -> RegistryResult<()> {
        if self.inner.available.load(AtomicOrdering::SeqCst) {
            Ok(())
        } else {
            Err(RegistryError::Unavailable {
                endpoint: endpoint.to_string(),
                message: "store offline".to_string(),
            })
        }
    }
}

impl Inner {
    fn is_live(&self, lease: LeaseId) -> bool {
        self.leases
            .get(&lease)
            .map(|l| l.deadline > Instant::now())
            .unwrap_or(false)
    }

    fn remove_lease(&self, lease: LeaseId) -> bool {
        let removed = self.leases.remove(&lease);
        if let Some((_, l)) = &removed {
            l.cancel.cancel();
        }
        self.kv.retain(|_, entry| entry.lease != lease);
        removed.is_some()
    }

    fn purge_expired(&self) {
        let now = Instant::now();
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|l| l.deadline <= now)
            .map(|l| *l.key())
            .collect();
        for lease in expired {
            trace!(target: "omega::registry", lease = lease, "Lease expired");
            self.remove_lease(lease);
        }
    }

    /// Push the deadline forward; false when the lease is gone.
    fn refresh(&self, lease: LeaseId) -> bool {
        match self.leases.get_mut(&lease) {
            Some(mut l) if l.deadline > Instant::now() => {
                l.deadline = Instant::now() + l.ttl;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn status(&self, endpoint: &str) -> RegistryResult<()> {
        self.check(endpoint)
    }

    async fn grant(&self, ttl_secs: i64) -> RegistryResult<LeaseId> {
        self.check("memory")?;
        let ttl = Duration::from_secs(ttl_secs.max(1) as u64);
        let id = self.inner.next_id.fetch_add(1, AtomicOrdering::SeqCst);
        self.inner.leases.insert(
            id,
            Lease {
                ttl,
                deadline: Instant::now() + ttl,
                cancel: CancellationToken::new(),
            },
        );
        Ok(id)
    }

    async fn put(&self, key: &str, value: &str, lease: LeaseId) -> RegistryResult<()> {
        self.check("memory")?;
        if !self.inner.is_live(lease) {
            return Err(RegistryError::LeaseNotFound { lease });
        }
        self.inner.kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                lease,
            },
        );
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> RegistryResult<KeepAliveStream> {
        self.check("memory")?;
        let (ttl, cancel) = match self.inner.leases.get(&lease) {
            Some(l) if l.deadline > Instant::now() => (l.ttl, l.cancel.clone()),
            _ => return Err(RegistryError::LeaseNotFound { lease }),
        };

        let (tx, rx) = flume::bounded(16);
        let inner = self.inner.clone();
        let period = (ttl / 3).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if !inner.available.load(AtomicOrdering::SeqCst) || !inner.refresh(lease) {
                            break;
                        }
                        if let Err(flume::TrySendError::Disconnected(_)) = tx.try_send(lease) {
                            break;
                        }
                    }
                }
            }
            trace!(target: "omega::registry", lease = lease, "Keep-alive ended");
        });

        Ok(KeepAliveStream::new(rx))
    }

    async fn revoke(&self, lease: LeaseId) -> RegistryResult<()> {
        self.check("memory")?;
        if self.inner.remove_lease(lease) {
            Ok(())
        } else {
            Err(RegistryError::LeaseNotFound { lease })
        }
    }

    async fn get_prefix(&self, prefix: &str) -> RegistryResult<Vec<(String, String)>> {
        self.check("memory")?;
        self.inner.purge_expired();
        let mut entries: Vec<(String, String)> = self
            .inner
            .kv
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| (e.key().clone(), e.value().value.clone()))
            .collect();
        entries.sort();
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_requires_live_lease() {
        let store = MemoryLeaseStore::new();
        assert!(matches!(
            store.put("/k", "v", 42).await,
            Err(RegistryError::LeaseNotFound { lease: 42 })
        ));

        let lease = store.grant(10).await.unwrap();
        store.put("/k", "v", lease).await.unwrap();
        assert_eq!(store.get("/k").as_deref(), Some("v"));

        store.revoke(lease).await.unwrap();
        assert_eq!(store.get("/k"), None);
        assert!(store.revoke(lease).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires_without_keep_alive() {
        let store = MemoryLeaseStore::new();
        let lease = store.grant(2).await.unwrap();
        store.put("/svc/a", "1", lease).await.unwrap();

        tokio::time::advance(Duration::from_millis(2100)).await;
        assert!(store.get_prefix("/svc/").await.unwrap().is_empty());
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_renews_and_closes_on_expire() {
        let store = MemoryLeaseStore::new();
        let lease = store.grant(3).await.unwrap();
        store.put("/svc/a", "1", lease).await.unwrap();
        let mut stream = store.keep_alive(lease).await.unwrap();

        for _ in 0..5 {
            assert_eq!(stream.next().await, Some(lease));
        }
        // Well past the lease TTL; renewals kept it alive.
        assert_eq!(store.get("/svc/a").as_deref(), Some("1"));

        store.expire_lease(lease);
        while stream.next().await.is_some() {}
        assert_eq!(store.get("/svc/a"), None);
    }

    #[tokio::test]
    async fn test_offline_store_rejects_calls() {
        let store = MemoryLeaseStore::new();
        store.set_available(false);
        assert!(store.grant(5).await.is_err());
        assert!(store.get_prefix("/").await.is_err());
        store.set_available(true);
        assert!(store.grant(5).await.is_ok());
    }
}
