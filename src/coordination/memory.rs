//! In-process coordination store.
//!
//! Lease expiry follows `tokio::time`, so tests running with a paused clock
//! can advance time deterministically. Several coordinators sharing one
//! `Arc<MemoryStore>` behave like nodes sharing an external store.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{CoordinationError, CoordinationStore, LeaseId, StoreEntry};

struct Lease {
    ttl: Duration,
    expires_at: Instant,
}

struct Stored {
    value: Vec<u8>,
    lease: Option<LeaseId>,
    mod_revision: i64,
}

#[derive(Default)]
struct Inner {
    next_lease: LeaseId,
    revision: i64,
    leases: HashMap<LeaseId, Lease>,
    kv: BTreeMap<String, Stored>,
}

impl Inner {
    /// Drop expired leases and every key bound to them.
    fn expire(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, l)| l.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.drop_lease(id);
        }
    }

    fn drop_lease(&mut self, id: LeaseId) -> bool {
        let existed = self.leases.remove(&id).is_some();
        self.kv.retain(|_, v| v.lease != Some(id));
        existed
    }

    fn check_lease(&self, lease: Option<LeaseId>) -> Result<(), CoordinationError> {
        match lease {
            Some(id) if !self.leases.contains_key(&id) => Err(CoordinationError::LeaseExpired(id)),
            _ => Ok(()),
        }
    }

    fn write(&mut self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) {
        self.revision += 1;
        self.kv.insert(
            key.to_string(),
            Stored {
                value,
                lease,
                mod_revision: self.revision,
            },
        );
    }
}

/// In-memory [`CoordinationStore`] with TTL leases.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with `RegistryUnavailable` until
    /// availability is restored. Leases keep expiring meanwhile.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of live leases.
    pub fn lease_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.expire(Instant::now());
        inner.leases.len()
    }

    fn lock(&self) -> Result<parking_lot::MutexGuard<'_, Inner>, CoordinationError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CoordinationError::RegistryUnavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        let mut inner = self.inner.lock();
        inner.expire(Instant::now());
        Ok(inner)
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, CoordinationError> {
        let mut inner = self.lock()?;
        inner.next_lease += 1;
        let id = inner.next_lease;
        inner.leases.insert(
            id,
            Lease {
                ttl,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<(), CoordinationError> {
        let mut inner = self.lock()?;
        match inner.leases.get_mut(&lease) {
            Some(l) => {
                l.expires_at = Instant::now() + l.ttl;
                Ok(())
            }
            None => Err(CoordinationError::LeaseExpired(lease)),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<(), CoordinationError> {
        let mut inner = self.lock()?;
        inner.drop_lease(lease);
        Ok(())
    }

    async fn create_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<bool, CoordinationError> {
        let mut inner = self.lock()?;
        inner.check_lease(lease)?;
        if inner.kv.contains_key(key) {
            return Ok(false);
        }
        inner.write(key, value, lease);
        Ok(true)
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<(), CoordinationError> {
        let mut inner = self.lock()?;
        inner.check_lease(lease)?;
        inner.write(key, value, lease);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<StoreEntry>, CoordinationError> {
        let inner = self.lock()?;
        Ok(inner.kv.get(key).map(|s| StoreEntry {
            key: key.to_string(),
            value: s.value.clone(),
            lease: s.lease,
            mod_revision: s.mod_revision,
        }))
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<StoreEntry>, CoordinationError> {
        let inner = self.lock()?;
        Ok(inner
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, s)| StoreEntry {
                key: k.clone(),
                value: s.value.clone(),
                lease: s.lease,
                mod_revision: s.mod_revision,
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<bool, CoordinationError> {
        let mut inner = self.lock()?;
        Ok(inner.kv.remove(key).is_some())
    }
}
