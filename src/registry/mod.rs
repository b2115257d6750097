// ============================================================================
// SECTION 9: SERVICE REGISTRY
// ============================================================================
// Lease-backed registration and discovery:
// - `LeaseStore` abstracts the key-value store (etcd or in-memory)
// - `Registry::register` probes endpoints, grants a lease, puts the record
//   and keeps the lease alive
// - a background task re-registers whenever the keep-alive stream closes
// - `Registry::resolve` lists the live records under a service key
// ============================================================================

pub mod memory;

#[cfg(feature = "etcd")]
pub mod etcd;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{RegistryError, RegistryResult};

pub use memory::MemoryLeaseStore;

/// Lease identifier issued by the store.
pub type LeaseId = i64;

/// Bound applied to every single store round-trip made by the registry.
pub const STORE_TIMEOUT: Duration = Duration::from_secs(5);

// ----------------------------------------------------------------------------
// 9.1 Lease Store Abstraction
// ----------------------------------------------------------------------------

/// Responses of a lease keep-alive. The stream ends when the lease (or the
/// connection carrying it) is gone.
#[derive(Debug)]
pub struct KeepAliveStream {
    rx: flume::Receiver<LeaseId>,
}

impl KeepAliveStream {
    pub fn new(rx: flume::Receiver<LeaseId>) -> Self {
        Self { rx }
    }

    /// Next renewal acknowledgement; `None` once the stream closed.
    pub async fn next(&mut self) -> Option<LeaseId> {
        self.rx.recv_async().await.ok()
    }
}

/// Minimal lease-based key-value store used for registration.
#[async_trait]
pub trait LeaseStore: Send + Sync + fmt::Debug {
    /// Check that `endpoint` answers.
    async fn status(&self, endpoint: &str) -> RegistryResult<()>;

    /// Grant a lease living `ttl_secs` seconds unless renewed.
    async fn grant(&self, ttl_secs: i64) -> RegistryResult<LeaseId>;

    /// Write `key = value`, bound to `lease`.
    async fn put(&self, key: &str, value: &str, lease: LeaseId) -> RegistryResult<()>;

    /// Start renewing `lease`.
    async fn keep_alive(&self, lease: LeaseId) -> RegistryResult<KeepAliveStream>;

    /// Revoke `lease`, deleting every key bound to it.
    async fn revoke(&self, lease: LeaseId) -> RegistryResult<()>;

    /// All `(key, value)` pairs under `prefix`, sorted by key.
    async fn get_prefix(&self, prefix: &str) -> RegistryResult<Vec<(String, String)>>;
}

/// Open the store the binaries register into.
#[cfg(feature = "etcd")]
pub async fn connect_store(endpoints: &[String]) -> RegistryResult<Arc<dyn LeaseStore>> {
    let store = etcd::EtcdLeaseStore::connect(endpoints).await?;
    Ok(Arc::new(store))
}

/// Open the store the binaries register into. Without the `etcd` feature
/// records only live inside this process.
#[cfg(not(feature = "etcd"))]
pub async fn connect_store(endpoints: &[String]) -> RegistryResult<Arc<dyn LeaseStore>> {
    warn!(
        target: "omega::registry",
        endpoints = ?endpoints,
        "Built without the etcd feature, using a process-local registry"
    );
    Ok(Arc::new(MemoryLeaseStore::new()))
}

async fn bounded<T, F>(operation: &str, fut: F) -> RegistryResult<T>
where
    F: std::future::Future<Output = RegistryResult<T>>,
{
    tokio::time::timeout(STORE_TIMEOUT, fut)
        .await
        .map_err(|_| RegistryError::Timeout {
            operation: operation.to_string(),
            timeout_ms: STORE_TIMEOUT.as_millis() as u64,
        })?
}

// ----------------------------------------------------------------------------
// 9.2 Retry Policy
// ----------------------------------------------------------------------------

/// Delay between re-registration attempts, as a function of the attempt
/// number (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Same delay for every attempt
    Fixed(Duration),
    /// `base * 2^(attempt - 1)`, capped at `max`
    Exponential { base: Duration, max: Duration },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Fixed(Duration::from_secs(10))
    }
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            RetryPolicy::Fixed(delay) => delay,
            RetryPolicy::Exponential { base, max } => {
                let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

// ----------------------------------------------------------------------------
// 9.3 Registration
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct LeaseState {
    lease: Option<LeaseId>,
}

/// Registers services into a [`LeaseStore`] and resolves them back.
#[derive(Debug, Clone)]
pub struct Registry {
    store: Arc<dyn LeaseStore>,
    retry: RetryPolicy,
}

impl Registry {
    pub fn new(store: Arc<dyn LeaseStore>) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }

    /// Publish `/<service>/<inner_ip>:<port> = <outer_ip>:<port>` under a
    /// lease of `ttl_secs` and keep it published until the returned handle
    /// is revoked or dropped.
    pub async fn register(
        &self,
        service: &str,
        inner_ip: &str,
        outer_ip: &str,
        port: u16,
        endpoints: &[String],
        ttl_secs: i64,
    ) -> RegistryResult<Registration> {
        self.probe(endpoints).await?;

        let key = format!("/{}/{}:{}", service.trim_matches('/'), inner_ip, port);
        let value = format!("{}:{}", outer_ip, port);

        let (lease, stream) = establish(self.store.as_ref(), &key, &value, ttl_secs).await?;
        info!(
            target: "omega::registry",
            key = %key,
            value = %value,
            lease = lease,
            "Service registered"
        );

        let state = Arc::new(Mutex::new(LeaseState { lease: Some(lease) }));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(maintain(
            self.store.clone(),
            self.retry,
            key.clone(),
            value.clone(),
            ttl_secs,
            stream,
            state.clone(),
            cancel.clone(),
        ));

        Ok(Registration {
            store: self.store.clone(),
            key,
            value,
            state,
            cancel,
            handle: Some(handle),
        })
    }

    /// Probe endpoints in order; the first one answering wins.
    async fn probe(&self, endpoints: &[String]) -> RegistryResult<()> {
        let mut last_err = RegistryError::NoEndpoints;
        for endpoint in endpoints {
            match bounded("status", self.store.status(endpoint)).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(target: "omega::registry", endpoint = %endpoint, error = %e, "Endpoint probe failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Live values under `service`, e.g. the collector addresses of a group.
    pub async fn resolve(&self, service: &str) -> RegistryResult<Vec<String>> {
        let prefix = format!("/{}/", service.trim_matches('/'));
        let entries = bounded("get", self.store.get_prefix(&prefix)).await?;
        Ok(entries.into_iter().map(|(_, value)| value).collect())
    }
}

async fn establish(
    store: &dyn LeaseStore,
    key: &str,
    value: &str,
    ttl_secs: i64,
) -> RegistryResult<(LeaseId, KeepAliveStream)> {
    let lease = bounded("grant", store.grant(ttl_secs)).await?;
    bounded("put", store.put(key, value, lease)).await?;
    let stream = bounded("keep_alive", store.keep_alive(lease)).await?;
    Ok((lease, stream))
}

#[allow(clippy::too_many_arguments)]
async fn maintain(
    store: Arc<dyn LeaseStore>,
    retry: RetryPolicy,
    key: String,
    value: String,
    ttl_secs: i64,
    mut stream: KeepAliveStream,
    state: Arc<Mutex<LeaseState>>,
    cancel: CancellationToken,
) {
    loop {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                ack = stream.next() => if ack.is_none() { break },
            }
        }

        error!(
            target: "omega::registry",
            key = %key,
            value = %value,
            "Registry status is offline: register service retrying..."
        );

        // Lease state stays locked until the record is back.
        let mut guard = state.lock().await;
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return;
            }
            match establish(store.as_ref(), &key, &value, ttl_secs).await {
                Ok((lease, renewed)) => {
                    guard.lease = Some(lease);
                    stream = renewed;
                    break;
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    let delay = retry.delay(attempt);
                    error!(
                        target: "omega::registry",
                        error = %e,
                        attempt = attempt,
                        retry_in = ?delay,
                        "Retrying register service failure"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        drop(guard);

        info!(
            target: "omega::registry",
            key = %key,
            value = %value,
            "Registry status is online: register service complete"
        );
    }
}

/// A live registration. Revoke it to delete the record; dropping it only
/// stops renewal and lets the lease expire.
#[derive(Debug)]
pub struct Registration {
    store: Arc<dyn LeaseStore>,
    key: String,
    value: String,
    state: Arc<Mutex<LeaseState>>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Registration {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Lease currently backing the record.
    pub async fn lease(&self) -> Option<LeaseId> {
        self.state.lock().await.lease
    }

    /// Stop renewal and revoke the lease, bounded by [`STORE_TIMEOUT`].
    pub async fn revoke(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }

        let mut guard = self.state.lock().await;
        if let Some(lease) = guard.lease.take() {
            match bounded("revoke", self.store.revoke(lease)).await {
                Ok(()) => info!(target: "omega::registry", key = %self.key, lease = lease, "Service deregistered"),
                Err(e) => warn!(target: "omega::registry", key = %self.key, error = %e, "Revoke lease failure"),
            }
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ----------------------------------------------------------------------------
// 9.4 Client-side Balancing
// ----------------------------------------------------------------------------

/// Round-robin picker over resolved addresses.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pick<'a>(&self, addrs: &'a [String]) -> Option<&'a str> {
        if addrs.is_empty() {
            return None;
        }
        let i = self.next.fetch_add(1, AtomicOrdering::Relaxed) % addrs.len();
        Some(addrs[i].as_str())
    }
}
