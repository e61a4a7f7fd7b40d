//! Externalised per-key computation state.
//!
//! Workers persist an opaque blob per `(key, computation_type)` after every
//! step. Entries carry a TTL; anything older is treated as absent so a new
//! owner cold-starts instead of resuming from stale state. On ownership change
//! all entries for a key are republished under the new owner, tagged with
//! where they came from, before traffic is routed there.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::work_item::ComputationType;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateKey {
    pub key: String,
    pub computation_type: ComputationType,
}

impl StateKey {
    pub fn new(key: impl Into<String>, computation_type: impl Into<ComputationType>) -> Self {
        Self {
            key: key.into(),
            computation_type: computation_type.into(),
        }
    }
}

/// Where a migrated entry came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub from: String,
    pub to: String,
    pub migrated_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntry {
    pub blob: Vec<u8>,
    pub owner_hint: Option<String>,
    pub updated_at_ms: i64,
    #[serde(default)]
    pub provenance: Option<Provenance>,
}

#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    #[error("state store unavailable: {0}")]
    Unavailable(String),
    #[error("state serialization failed: {0}")]
    Serialization(String),
}

/// TTL-capable key-value store backing [`StateSynchronizer`].
///
/// Implementations must stop returning an entry once its TTL has elapsed.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn put(&self, key: &StateKey, entry: StateEntry, ttl: Duration) -> Result<(), StateStoreError>;

    async fn get(&self, key: &StateKey) -> Result<Option<StateEntry>, StateStoreError>;

    /// All live entries for a work key, across computation types.
    async fn entries_for(&self, key: &str) -> Result<Vec<(StateKey, StateEntry)>, StateStoreError>;

    async fn delete(&self, key: &StateKey) -> Result<(), StateStoreError>;
}

/// In-process [`StateStore`]. Expiry follows `tokio::time`, so paused-clock
/// tests can drive it.
#[derive(Default)]
pub struct MemoryStateStore {
    entries: Mutex<HashMap<StateKey, (StateEntry, Instant)>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().values().filter(|(_, exp)| *exp > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn put(&self, key: &StateKey, entry: StateEntry, ttl: Duration) -> Result<(), StateStoreError> {
        self.entries
            .lock()
            .insert(key.clone(), (entry, Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &StateKey) -> Result<Option<StateEntry>, StateStoreError> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((entry, expires_at)) if *expires_at > Instant::now() => Ok(Some(entry.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn entries_for(&self, key: &str) -> Result<Vec<(StateKey, StateEntry)>, StateStoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, (_, exp)| *exp > now);
        let mut out: Vec<(StateKey, StateEntry)> = entries
            .iter()
            .filter(|(k, _)| k.key == key)
            .map(|(k, (e, _))| (k.clone(), e.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    async fn delete(&self, key: &StateKey) -> Result<(), StateStoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StateConfig {
    pub ttl: Duration,
    /// Bound on every individual store call
    pub op_timeout: Duration,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            op_timeout: Duration::from_secs(1),
        }
    }
}

/// Node-local handle onto the shared state store.
#[derive(Clone)]
pub struct StateSynchronizer {
    node_id: String,
    store: Arc<dyn StateStore>,
    config: StateConfig,
}

impl StateSynchronizer {
    pub fn new(node_id: impl Into<String>, store: Arc<dyn StateStore>, config: StateConfig) -> Self {
        Self {
            node_id: node_id.into(),
            store,
            config,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn ttl(&self) -> Duration {
        self.config.ttl
    }

    /// Persist the latest state for `(key, computation_type)`, owned by this node.
    pub async fn save(
        &self,
        key: &str,
        computation_type: &ComputationType,
        blob: Vec<u8>,
    ) -> Result<(), StateStoreError> {
        let state_key = StateKey::new(key, computation_type.clone());
        let entry = StateEntry {
            blob,
            owner_hint: Some(self.node_id.clone()),
            updated_at_ms: crate::now_epoch_ms(),
            provenance: None,
        };
        self.bounded(self.store.put(&state_key, entry, self.config.ttl))
            .await
    }

    /// Prior state, or `None` if never written or older than the TTL.
    pub async fn load(
        &self,
        key: &str,
        computation_type: &ComputationType,
    ) -> Result<Option<Vec<u8>>, StateStoreError> {
        let state_key = StateKey::new(key, computation_type.clone());
        let entry = self.bounded(self.store.get(&state_key)).await?;
        Ok(entry
            .filter(|e| !self.is_stale(e))
            .map(|e| e.blob))
    }

    /// Republish every entry for `key` under `to`, tagged with provenance.
    /// Returns the number of entries moved.
    pub async fn migrate(&self, key: &str, from: &str, to: &str) -> Result<usize, StateStoreError> {
        if from == to {
            return Ok(0);
        }
        let entries = self.bounded(self.store.entries_for(key)).await?;
        let now_ms = crate::now_epoch_ms();
        let mut moved = 0;
        for (state_key, entry) in entries {
            if self.is_stale(&entry) {
                continue;
            }
            let migrated = StateEntry {
                blob: entry.blob,
                owner_hint: Some(to.to_string()),
                updated_at_ms: now_ms,
                provenance: Some(Provenance {
                    from: from.to_string(),
                    to: to.to_string(),
                    migrated_at_ms: now_ms,
                }),
            };
            self.bounded(self.store.put(&state_key, migrated, self.config.ttl))
                .await?;
            moved += 1;
        }
        debug!(key = %key, from = %from, to = %to, entries = moved, "state migrated");
        Ok(moved)
    }

    fn is_stale(&self, entry: &StateEntry) -> bool {
        let age_ms = crate::now_epoch_ms().saturating_sub(entry.updated_at_ms);
        age_ms > self.config.ttl.as_millis() as i64
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, StateStoreError>
    where
        F: std::future::Future<Output = Result<T, StateStoreError>>,
    {
        match tokio::time::timeout(self.config.op_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(StateStoreError::Unavailable(format!(
                "state store call exceeded {:?}",
                self.config.op_timeout
            ))),
        }
    }
}
