// ----------------------------------------------------------------------------
// 9.6 etcd Lease Store
// ----------------------------------------------------------------------------

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, GetOptions, PutOptions};
use tracing::{debug, trace};

use super::{KeepAliveStream, LeaseId, LeaseStore, STORE_TIMEOUT};
use crate::error::{RegistryError, RegistryResult};

fn backend(e: etcd_client::Error) -> RegistryError {
    RegistryError::backend(e.to_string())
}

/// [`LeaseStore`] backed by an etcd v3 cluster.
#[derive(Clone)]
pub struct EtcdLeaseStore {
    client: Client,
}

impl std::fmt::Debug for EtcdLeaseStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdLeaseStore").finish_non_exhaustive()
    }
}

impl EtcdLeaseStore {
    fn options() -> ConnectOptions {
        ConnectOptions::new()
            .with_connect_timeout(STORE_TIMEOUT)
            .with_timeout(STORE_TIMEOUT)
    }

    pub async fn connect(endpoints: &[String]) -> RegistryResult<Self> {
        if endpoints.is_empty() {
            return Err(RegistryError::NoEndpoints);
        }
        let client = Client::connect(endpoints, Some(Self::options()))
            .await
            .map_err(backend)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl LeaseStore for EtcdLeaseStore {
    async fn status(&self, endpoint: &str) -> RegistryResult<()> {
        // A dedicated client pins the probe to this one endpoint.
        let mut probe = Client::connect([endpoint], Some(Self::options()))
            .await
            .map_err(|e| RegistryError::Unavailable {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            })?;
        probe.status().await.map_err(|e| RegistryError::Unavailable {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        })?;
        Ok(())
    }

    async fn grant(&self, ttl_secs: i64) -> RegistryResult<LeaseId> {
        let mut client = self.client.clone();
        let resp = client.lease_grant(ttl_secs, None).await.map_err(backend)?;
        Ok(resp.id())
    }

    async fn put(&self, key: &str, value: &str, lease: LeaseId) -> RegistryResult<()> {
        let mut client = self.client.clone();
        client
            .put(key, value, Some(PutOptions::new().with_lease(lease)))
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> RegistryResult<KeepAliveStream> {
        let mut client = self.client.clone();
        let ttl = client
            .lease_time_to_live(lease, None)
            .await
            .map_err(backend)?
            .granted_ttl();
        let (mut keeper, mut responses) = client.lease_keep_alive(lease).await.map_err(backend)?;

        let (tx, rx) = flume::bounded(16);
        let period = Duration::from_secs((ttl.max(3) / 3) as u64);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(e) = keeper.keep_alive().await {
                    debug!(target: "omega::registry", lease = lease, error = %e, "Keep-alive request failed");
                    break;
                }
                match responses.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => {
                        if let Err(flume::TrySendError::Disconnected(_)) = tx.try_send(lease) {
                            break;
                        }
                    }
                    Ok(_) => break,
                    Err(e) => {
                        debug!(target: "omega::registry", lease = lease, error = %e, "Keep-alive stream failed");
                        break;
                    }
                }
            }
            trace!(target: "omega::registry", lease = lease, "Keep-alive ended");
        });

        Ok(KeepAliveStream::new(rx))
    }

    async fn revoke(&self, lease: LeaseId) -> RegistryResult<()> {
        let mut client = self.client.clone();
        client.lease_revoke(lease).await.map_err(backend)?;
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> RegistryResult<Vec<(String, String)>> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(backend)?;
        let mut entries = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            let key = kv.key_str().map_err(backend)?;
            let value = kv.value_str().map_err(backend)?;
            entries.push((key.to_string(), value.to_string()));
        }
        entries.sort();
        Ok(entries)
    }
}
