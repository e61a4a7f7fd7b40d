//! etcd-backed coordination store.
//!
//! Leases map onto etcd leases, create-if-absent onto a transaction guarded
//! by `create_revision == 0`.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, GetOptions, KeyValue, PutOptions, Txn, TxnOp,
};
use tracing::debug;

use super::{CoordinationError, CoordinationStore, LeaseId, StoreEntry};

#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connect to etcd. An empty endpoint list means a local etcd.
    pub async fn connect(
        endpoints: &[String],
        connect_timeout: Duration,
    ) -> Result<Self, CoordinationError> {
        let endpoints = if endpoints.is_empty() {
            vec!["http://127.0.0.1:2379".to_string()]
        } else {
            endpoints.to_vec()
        };

        let opts = ConnectOptions::default().with_connect_timeout(connect_timeout);
        let client = Client::connect(endpoints.clone(), Some(opts))
            .await
            .map_err(|e| CoordinationError::ConnectionFailed(e.to_string()))?;
        debug!(endpoints = ?endpoints, "connected to etcd");
        Ok(Self { client })
    }
}

fn unavailable(e: etcd_client::Error) -> CoordinationError {
    CoordinationError::RegistryUnavailable(e.to_string())
}

/// Writes bound to a lease etcd no longer knows fail with "lease not found".
fn write_error(e: etcd_client::Error, lease: Option<LeaseId>) -> CoordinationError {
    match lease {
        Some(id) if e.to_string().contains("lease not found") => CoordinationError::LeaseExpired(id),
        _ => unavailable(e),
    }
}

fn to_entry(kv: &KeyValue) -> StoreEntry {
    StoreEntry {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: kv.value().to_vec(),
        lease: (kv.lease() != 0).then_some(kv.lease()),
        mod_revision: kv.mod_revision(),
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, CoordinationError> {
        // etcd TTLs are whole seconds
        let ttl_secs = ttl.as_millis().div_ceil(1000).max(1) as i64;
        let resp = self
            .client
            .clone()
            .lease_grant(ttl_secs, None)
            .await
            .map_err(unavailable)?;
        Ok(resp.id())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<(), CoordinationError> {
        let (mut keeper, mut stream) = self
            .client
            .clone()
            .lease_keep_alive(lease)
            .await
            .map_err(unavailable)?;
        keeper.keep_alive().await.map_err(unavailable)?;
        match stream.message().await.map_err(unavailable)? {
            Some(resp) if resp.ttl() > 0 => Ok(()),
            _ => Err(CoordinationError::LeaseExpired(lease)),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), CoordinationError> {
        self.client
            .clone()
            .lease_revoke(lease)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn create_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<bool, CoordinationError> {
        let put_opts = lease.map(|id| PutOptions::new().with_lease(id));
        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(key, value, put_opts)]);
        let resp = self
            .client
            .clone()
            .txn(txn)
            .await
            .map_err(|e| write_error(e, lease))?;
        Ok(resp.succeeded())
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<(), CoordinationError> {
        let put_opts = lease.map(|id| PutOptions::new().with_lease(id));
        self.client
            .clone()
            .put(key, value, put_opts)
            .await
            .map_err(|e| write_error(e, lease))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<StoreEntry>, CoordinationError> {
        let resp = self
            .client
            .clone()
            .get(key, None)
            .await
            .map_err(unavailable)?;
        Ok(resp.kvs().first().map(to_entry))
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<StoreEntry>, CoordinationError> {
        let resp = self
            .client
            .clone()
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(unavailable)?;
        let mut entries: Vec<StoreEntry> = resp.kvs().iter().map(to_entry).collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    async fn delete(&self, key: &str) -> Result<bool, CoordinationError> {
        let resp = self
            .client
            .clone()
            .delete(key, None)
            .await
            .map_err(unavailable)?;
        Ok(resp.deleted() > 0)
    }
}
