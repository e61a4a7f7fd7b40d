//! Consistent hash ring with virtual nodes.
//!
//! Each physical node is hashed onto `virtual_nodes` positions of a `u64` ring.
//! A key is owned by the node at the first position clockwise from the key's
//! hash, wrapping past `u64::MAX` back to the start.
//!
//! [`HashRing`] values are immutable: `with_node`/`without_node` return a new
//! ring with a bumped version. [`SharedRing`] publishes those snapshots through
//! an `ArcSwap`, so a reader holding a snapshot never observes a partial edit.

use std::collections::BTreeSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

pub const DEFAULT_VIRTUAL_NODES: u32 = 150;

/// One virtual-node position on the ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingEntry {
    pub position: u64,
    pub node_id: String,
}

/// Immutable, versioned ring snapshot.
#[derive(Debug, Clone)]
pub struct HashRing {
    virtual_nodes: u32,
    version: u64,
    nodes: BTreeSet<String>,
    /// Sorted by (position, node_id)
    entries: Vec<RingEntry>,
}

impl HashRing {
    pub fn new(virtual_nodes: u32) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            version: 0,
            nodes: BTreeSet::new(),
            entries: Vec::new(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn virtual_nodes(&self) -> u32 {
        self.virtual_nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains(node_id)
    }

    /// Physical node ids, sorted.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(String::as_str)
    }

    pub fn entries(&self) -> &[RingEntry] {
        &self.entries
    }

    /// Return a new ring that also contains `node_id`, or `None` if it is already present.
    pub fn with_node(&self, node_id: &str) -> Option<HashRing> {
        if self.nodes.contains(node_id) {
            return None;
        }
        let mut next = self.clone();
        next.nodes.insert(node_id.to_string());
        next.entries.reserve(self.virtual_nodes as usize);
        for i in 0..self.virtual_nodes {
            next.entries.push(RingEntry {
                position: virtual_node_position(node_id, i),
                node_id: node_id.to_string(),
            });
        }
        next.entries
            .sort_unstable_by(|a, b| a.position.cmp(&b.position).then_with(|| a.node_id.cmp(&b.node_id)));
        next.version += 1;
        Some(next)
    }

    /// Return a new ring without `node_id`, or `None` if it was not present.
    pub fn without_node(&self, node_id: &str) -> Option<HashRing> {
        if !self.nodes.contains(node_id) {
            return None;
        }
        let mut next = self.clone();
        next.nodes.remove(node_id);
        next.entries.retain(|e| e.node_id != node_id);
        next.version += 1;
        Some(next)
    }

    /// The node owning `key`, or `None` on an empty ring.
    pub fn owner(&self, key: &str) -> Option<&str> {
        let idx = self.first_index_at_or_after(hash_key(key.as_bytes()))?;
        Some(self.entries[idx].node_id.as_str())
    }

    /// Up to `n` distinct nodes, walking clockwise from `key`'s position.
    /// The first element is always `owner(key)`.
    pub fn replicas(&self, key: &str, n: usize) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(n.min(self.nodes.len()));
        let Some(start) = self.first_index_at_or_after(hash_key(key.as_bytes())) else {
            return out;
        };
        let wanted = n.min(self.nodes.len());
        for step in 0..self.entries.len() {
            if out.len() == wanted {
                break;
            }
            let entry = &self.entries[(start + step) % self.entries.len()];
            if !out.iter().any(|id| id == &entry.node_id) {
                out.push(entry.node_id.clone());
            }
        }
        out
    }

    fn first_index_at_or_after(&self, hash: u64) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        let idx = self.entries.partition_point(|e| e.position < hash);
        Some(if idx >= self.entries.len() { 0 } else { idx })
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new(DEFAULT_VIRTUAL_NODES)
    }
}

/// Copy-on-write publisher of [`HashRing`] snapshots.
///
/// Writers are serialised; readers load the current `Arc<HashRing>` lock-free.
pub struct SharedRing {
    current: ArcSwap<HashRing>,
    write_lock: Mutex<()>,
}

impl SharedRing {
    pub fn new(virtual_nodes: u32) -> Self {
        Self::from_ring(HashRing::new(virtual_nodes))
    }

    pub fn from_ring(ring: HashRing) -> Self {
        Self {
            current: ArcSwap::from_pointee(ring),
            write_lock: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Arc<HashRing> {
        self.current.load_full()
    }

    /// Returns true if the ring changed.
    pub fn add_node(&self, node_id: &str) -> bool {
        let _w = self.write_lock.lock();
        match self.current.load().with_node(node_id) {
            Some(next) => {
                self.current.store(Arc::new(next));
                true
            }
            None => false,
        }
    }

    /// Returns true if the ring changed.
    pub fn remove_node(&self, node_id: &str) -> bool {
        let _w = self.write_lock.lock();
        match self.current.load().without_node(node_id) {
            Some(next) => {
                self.current.store(Arc::new(next));
                true
            }
            None => false,
        }
    }

    pub fn owner(&self, key: &str) -> Option<String> {
        self.current.load().owner(key).map(str::to_string)
    }

    pub fn replicas(&self, key: &str, n: usize) -> Vec<String> {
        self.current.load().replicas(key, n)
    }
}

/// Stable 64-bit hash used for ring positions and keys.
pub fn hash_key(data: &[u8]) -> u64 {
    mix64(fnv1a64(data))
}

fn virtual_node_position(node_id: &str, index: u32) -> u64 {
    hash_key(format!("{node_id}#{index}").as_bytes())
}

fn fnv1a64(data: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x00000100000001B3;
    let mut hash = FNV_OFFSET;
    for b in data {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

fn mix64(mut x: u64) -> u64 {
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_past_last_position() {
        let ring = HashRing::new(4).with_node("a").unwrap();
        let last = ring.entries().last().unwrap().position;
        // Anything hashing beyond the last position belongs to the first entry.
        let idx = ring.first_index_at_or_after(last.wrapping_add(1)).unwrap();
        if last < u64::MAX {
            assert_eq!(idx, 0);
        }
    }

    #[test]
    fn version_bumps_only_on_change() {
        let ring = HashRing::new(8);
        let ring = ring.with_node("a").unwrap();
        assert_eq!(ring.version(), 1);
        assert!(ring.with_node("a").is_none());
        assert!(ring.without_node("b").is_none());
        let ring = ring.without_node("a").unwrap();
        assert_eq!(ring.version(), 2);
        assert!(ring.entries().is_empty());
    }
}
