//! Boundary to the external coordination store.
//!
//! The coordinator needs a linearizable key-value service with TTL leases and
//! an atomic create-if-absent write. Available backends:
//!
//! - `memory`: in-process store for single-process clusters and tests
//! - `etcd`: etcd leases and transactions

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

pub mod etcd;
pub mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

pub type LeaseId = i64;

/// Information about a cluster member, stored under its presence key.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MemberInfo {
    pub node_id: String,
    /// Maximum number of keys this node accepts
    pub capacity: usize,
    /// Unix timestamp in milliseconds when this node started
    #[serde(default)]
    pub startup_time_ms: Option<i64>,
    /// Hostname of the machine running this node
    #[serde(default)]
    pub hostname: Option<String>,
}

/// Get the hostname of the current machine
pub fn get_hostname() -> Option<String> {
    hostname::get().ok().and_then(|h| h.into_string().ok())
}

/// A stored value and the lease (if any) it is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub lease: Option<LeaseId>,
    pub mod_revision: i64,
}

/// Error type for coordination operations
#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    #[error("coordination store unavailable: {0}")]
    RegistryUnavailable(String),
    #[error("lease {0} expired")]
    LeaseExpired(LeaseId),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("backend error: {0}")]
    BackendError(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("not the leader")]
    NotLeader,
    #[error("shutdown in progress")]
    ShuttingDown,
}

/// Linearizable key-value store with TTL leases.
///
/// A key written with a lease disappears when the lease expires or is revoked.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, CoordinationError>;

    /// Refresh a lease for another full TTL. Fails with `LeaseExpired` if the
    /// store no longer knows the lease.
    async fn keep_alive(&self, lease: LeaseId) -> Result<(), CoordinationError>;

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), CoordinationError>;

    /// Write `key` only if it does not exist. Returns whether the write happened.
    async fn create_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<bool, CoordinationError>;

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<(), CoordinationError>;

    async fn get(&self, key: &str) -> Result<Option<StoreEntry>, CoordinationError>;

    /// All entries whose key starts with `prefix`, ordered by key.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<StoreEntry>, CoordinationError>;

    /// Returns whether a key was removed.
    async fn delete(&self, key: &str) -> Result<bool, CoordinationError>;
}

/// Run a store call under a deadline; an elapsed deadline means the store is
/// unreachable.
pub async fn bounded<T, F>(timeout: Duration, fut: F) -> Result<T, CoordinationError>
where
    F: Future<Output = Result<T, CoordinationError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_) => Err(CoordinationError::RegistryUnavailable(format!(
            "store call exceeded {:?}",
            timeout
        ))),
    }
}

/// Key layout under the cluster prefix.
pub mod keys {
    pub fn leader_key(cluster_prefix: &str) -> String {
        format!("{}/leader", cluster_prefix)
    }
    pub fn members_prefix(cluster_prefix: &str) -> String {
        format!("{}/members/", cluster_prefix)
    }
    pub fn member_key(cluster_prefix: &str, node_id: &str) -> String {
        format!("{}{}", members_prefix(cluster_prefix), node_id)
    }
    pub fn metrics_prefix(cluster_prefix: &str) -> String {
        format!("{}/metrics/", cluster_prefix)
    }
    /// Latest `NodeMetrics` report, bound to the node's presence lease.
    pub fn metrics_key(cluster_prefix: &str, node_id: &str) -> String {
        format!("{}{}", metrics_prefix(cluster_prefix), node_id)
    }
    /// Canonical JSON-serialized `AssignmentTable`.
    pub fn assignments_key(cluster_prefix: &str) -> String {
        format!("{}/assignments", cluster_prefix)
    }
    pub fn pending_prefix(cluster_prefix: &str) -> String {
        format!("{}/pending/", cluster_prefix)
    }
    /// Assignment request for a key a follower could not place itself.
    pub fn pending_key(cluster_prefix: &str, key: &str) -> String {
        format!("{}{}", pending_prefix(cluster_prefix), key)
    }

    /// Last path segment of a key under one of the prefixes above.
    pub fn suffix<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(prefix).filter(|s| !s.is_empty())
    }
}
