//! Key ownership: placement, rebalancing and node membership changes.
//!
//! The [`PodAssignmentManager`] owns the hash ring and the authoritative
//! [`AssignmentTable`]. It is only mutated by the elected leader; every
//! mutation publishes a new table version through an `ArcSwap`, so readers
//! always hold a complete snapshot.
//!
//! Moving a key is a handoff: mark it `in_transition`, announce the marked
//! table to the cluster, migrate its state to the new owner, then flip the
//! assignment. A migration that fails or misses its deadline leaves the key
//! with its original owner.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::convert::Infallible;
use std::fmt;
use std::future::{Future, ready};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use im::{OrdMap, OrdSet};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use crate::ring::{HashRing, SharedRing};
use crate::state_sync::{StateStoreError, StateSynchronizer};

#[derive(Debug, thiserror::Error)]
pub enum AssignmentError {
    #[error("no eligible node for key {key}")]
    NoEligibleNode { key: String },
    #[error("unknown node: {0}")]
    UnknownNode(String),
    #[error("node already registered: {0}")]
    DuplicateNode(String),
}

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("migration of {key} from {from} to {to} timed out after {timeout:?}")]
    Timeout {
        key: String,
        from: String,
        to: String,
        timeout: Duration,
    },
    #[error("state store error during migration: {0}")]
    Store(#[from] StateStoreError),
    #[error("in-transition marks could not be announced: {0}")]
    Announce(String),
}

#[derive(Debug, Clone)]
pub struct PlacementConfig {
    /// Ring successors considered for a new key
    pub replica_candidates: usize,
    /// A node at or above this load ratio takes no new keys
    pub saturation_ratio: f64,
    /// Rebalance only when max and min load ratios differ by more than this
    pub rebalance_threshold: f64,
    /// Deadline for migrating one key's state
    pub migration_timeout: Duration,
    pub virtual_nodes: u32,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            replica_candidates: 3,
            saturation_ratio: 0.9,
            rebalance_threshold: 0.3,
            migration_timeout: Duration::from_secs(2),
            virtual_nodes: crate::ring::DEFAULT_VIRTUAL_NODES,
        }
    }
}

/// Capacity and current load of one node as published in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeLoad {
    pub capacity: usize,
    pub current_load: usize,
}

impl NodeLoad {
    pub fn ratio(&self) -> f64 {
        self.current_load as f64 / self.capacity.max(1) as f64
    }
}

/// Versioned snapshot of who owns which key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssignmentTable {
    pub version: u64,
    pub assignments: OrdMap<String, String>,
    pub in_transition: OrdSet<String>,
    pub nodes: OrdMap<String, NodeLoad>,
}

impl AssignmentTable {
    pub fn owner(&self, key: &str) -> Option<&str> {
        self.assignments.get(key).map(String::as_str)
    }

    pub fn is_in_transition(&self, key: &str) -> bool {
        self.in_transition.contains(key)
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeLoad> {
        self.nodes.get(node_id)
    }

    /// Keys owned by `node_id`, ascending.
    pub fn keys_of(&self, node_id: &str) -> Vec<String> {
        self.assignments
            .iter()
            .filter(|(_, owner)| owner.as_str() == node_id)
            .map(|(k, _)| k.clone())
            .collect()
    }
}

/// A single key handoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMove {
    pub key: String,
    pub from: String,
    pub to: String,
}

impl fmt::Display for KeyMove {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} -> {}", self.key, self.from, self.to)
    }
}

#[derive(Debug, Default)]
pub struct RebalanceReport {
    pub moved: Vec<KeyMove>,
    pub aborted: Vec<(KeyMove, MigrationError)>,
    /// Moves skipped because membership changed while migrating
    pub superseded: Vec<KeyMove>,
}

#[derive(Debug, Default)]
pub struct UnregisterReport {
    pub reassigned: Vec<KeyMove>,
    pub unassigned: Vec<(String, AssignmentError)>,
    pub migration_failures: Vec<(KeyMove, MigrationError)>,
}

/// Mutable leader-side state behind the manager's lock.
struct ClusterState {
    table: AssignmentTable,
    keys_by_node: HashMap<String, BTreeSet<String>>,
}

impl ClusterState {
    fn empty() -> Self {
        Self {
            table: AssignmentTable::default(),
            keys_by_node: HashMap::new(),
        }
    }

    fn load_of(&self, node_id: &str) -> Option<NodeLoad> {
        self.table.nodes.get(node_id).copied()
    }

    fn set_owner(&mut self, key: &str, node_id: &str) {
        if let Some(prev) = self.table.assignments.insert(key.to_string(), node_id.to_string())
            && prev != node_id
        {
            self.detach(&prev, key);
        }
        if self
            .keys_by_node
            .entry(node_id.to_string())
            .or_default()
            .insert(key.to_string())
            && let Some(load) = self.table.nodes.get_mut(node_id)
        {
            load.current_load += 1;
        }
    }

    fn detach(&mut self, node_id: &str, key: &str) {
        if let Some(keys) = self.keys_by_node.get_mut(node_id)
            && keys.remove(key)
            && let Some(load) = self.table.nodes.get_mut(node_id)
        {
            load.current_load = load.current_load.saturating_sub(1);
        }
    }
}

/// Leader-owned key placement.
pub struct PodAssignmentManager {
    config: PlacementConfig,
    ring: SharedRing,
    state: Mutex<ClusterState>,
    published: ArcSwap<AssignmentTable>,
    state_sync: Option<StateSynchronizer>,
    metrics: Option<Metrics>,
}

impl PodAssignmentManager {
    pub fn new(config: PlacementConfig) -> Self {
        let ring = SharedRing::new(config.virtual_nodes);
        Self {
            config,
            ring,
            state: Mutex::new(ClusterState::empty()),
            published: ArcSwap::from_pointee(AssignmentTable::default()),
            state_sync: None,
            metrics: None,
        }
    }

    /// Migrate computation state through `sync` when keys move.
    pub fn with_state_sync(mut self, sync: StateSynchronizer) -> Self {
        self.state_sync = Some(sync);
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &PlacementConfig {
        &self.config
    }

    /// Current published table.
    pub fn snapshot(&self) -> Arc<AssignmentTable> {
        self.published.load_full()
    }

    pub fn ring(&self) -> Arc<HashRing> {
        self.ring.snapshot()
    }

    pub fn owner(&self, key: &str) -> Option<String> {
        self.published.load().owner(key).map(str::to_string)
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.published.load().nodes.keys().cloned().collect()
    }

    /// Add a node to the ring with the given key capacity. It receives keys
    /// through later `assign` calls or a `rebalance`.
    pub fn register_node(&self, node_id: &str, capacity: usize) -> Result<(), AssignmentError> {
        let mut state = self.state.lock();
        if state.table.nodes.contains_key(node_id) {
            return Err(AssignmentError::DuplicateNode(node_id.to_string()));
        }
        state.table.nodes.insert(
            node_id.to_string(),
            NodeLoad {
                capacity: capacity.max(1),
                current_load: 0,
            },
        );
        state.keys_by_node.entry(node_id.to_string()).or_default();
        self.ring.add_node(node_id);
        info!(node_id = %node_id, capacity, "node registered");
        self.publish(&mut state);
        Ok(())
    }

    /// Remove a node and re-assign each of its keys individually.
    ///
    /// The departed node cannot keep its keys, so they are flipped right away
    /// and held `in_transition` until their state has been migrated (or the
    /// migration failed, in which case the new owner starts cold).
    pub async fn unregister_node(&self, node_id: &str) -> Result<UnregisterReport, AssignmentError> {
        self.unregister_node_announced(node_id, |_| ready(Ok::<(), Infallible>(())))
            .await
    }

    /// [`unregister_node`](Self::unregister_node), calling `announce` with the
    /// table that holds the reassigned keys `in_transition` before any of their
    /// state moves. A failed announcement is logged; the departed node cannot
    /// serve the keys either way.
    pub async fn unregister_node_announced<F, Fut, E>(
        &self,
        node_id: &str,
        announce: F,
    ) -> Result<UnregisterReport, AssignmentError>
    where
        F: FnOnce(Arc<AssignmentTable>) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: fmt::Display,
    {
        let mut report = UnregisterReport::default();
        {
            let mut state = self.state.lock();
            if state.table.nodes.remove(node_id).is_none() {
                return Err(AssignmentError::UnknownNode(node_id.to_string()));
            }
            self.ring.remove_node(node_id);
            let orphaned = state.keys_by_node.remove(node_id).unwrap_or_default();
            info!(node_id = %node_id, orphaned = orphaned.len(), "node unregistered; reassigning keys");

            for key in orphaned {
                state.table.assignments.remove(&key);
                state.table.in_transition.remove(&key);
                match self.place(&state, &key) {
                    Ok(target) => {
                        state.set_owner(&key, &target);
                        state.table.in_transition.insert(key.clone());
                        report.reassigned.push(KeyMove {
                            key,
                            from: node_id.to_string(),
                            to: target,
                        });
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "orphaned key could not be reassigned");
                        report.unassigned.push((key, e));
                    }
                }
            }
            if let Some(m) = &self.metrics {
                m.remove_node(node_id);
            }
            self.publish(&mut state);
        }

        if !report.reassigned.is_empty()
            && let Err(e) = announce(self.snapshot()).await
        {
            warn!(node_id = %node_id, error = %e, "reassigned keys were not announced before migration");
        }

        for mv in &report.reassigned {
            if let Err(e) = self.migrate_state(mv).await {
                warn!(key = %mv.key, from = %mv.from, to = %mv.to, error = %e, "state migration for orphaned key failed; new owner starts cold");
                report.migration_failures.push((mv.clone(), e));
            }
        }

        if !report.reassigned.is_empty() {
            let mut state = self.state.lock();
            for mv in &report.reassigned {
                state.table.in_transition.remove(&mv.key);
            }
            self.publish(&mut state);
        }
        Ok(report)
    }

    /// Owner for `key`, placing it if it is not yet assigned.
    ///
    /// Prefers the least-loaded of the key's ring successors that is below the
    /// saturation ratio, then any unsaturated node in the cluster.
    pub fn assign(&self, key: &str) -> Result<String, AssignmentError> {
        let mut state = self.state.lock();
        if let Some(owner) = state.table.assignments.get(key) {
            return Ok(owner.clone());
        }
        let target = self.place(&state, key)?;
        state.set_owner(key, &target);
        debug!(key = %key, node_id = %target, "key assigned");
        self.publish(&mut state);
        Ok(target)
    }

    fn place(&self, state: &ClusterState, key: &str) -> Result<String, AssignmentError> {
        let eligible = |id: &str| {
            state
                .load_of(id)
                .is_some_and(|l| l.ratio() < self.config.saturation_ratio)
        };

        // Ring successors in clockwise order; ties keep that order.
        let mut best: Option<(String, NodeLoad)> = None;
        for candidate in self.ring.replicas(key, self.config.replica_candidates) {
            if !eligible(&candidate) {
                continue;
            }
            let Some(load) = state.load_of(&candidate) else {
                continue;
            };
            if best
                .as_ref()
                .is_none_or(|(_, b)| compare_ratio(&load, b) == Ordering::Less)
            {
                best = Some((candidate, load));
            }
        }
        if let Some((id, _)) = best {
            return Ok(id);
        }

        // Cluster-wide fallback; nodes iterate in id order so ties pick the smallest id.
        let mut fallback: Option<(&String, &NodeLoad)> = None;
        for (id, load) in state.table.nodes.iter() {
            if !eligible(id) {
                continue;
            }
            if fallback.is_none_or(|(_, b)| compare_ratio(load, b) == Ordering::Less) {
                fallback = Some((id, load));
            }
        }
        fallback
            .map(|(id, _)| id.clone())
            .ok_or_else(|| AssignmentError::NoEligibleNode {
                key: key.to_string(),
            })
    }

    /// Even out load ratios between nodes.
    ///
    /// Repeatedly pairs the most- and least-loaded nodes while their ratios
    /// differ by more than the threshold and moves keys between them. Each key
    /// is held `in_transition` while its state migrates and is only flipped once
    /// migration completes.
    pub async fn rebalance(&self) -> RebalanceReport {
        self.rebalance_announced(|_| ready(Ok::<(), Infallible>(())))
            .await
    }

    /// [`rebalance`](Self::rebalance), calling `announce` with the table that
    /// carries the new `in_transition` marks before any state moves. If the
    /// announcement fails every planned move is aborted and the keys stay put.
    pub async fn rebalance_announced<F, Fut, E>(&self, announce: F) -> RebalanceReport
    where
        F: FnOnce(Arc<AssignmentTable>) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: fmt::Display,
    {
        let mut report = RebalanceReport::default();
        let moves = {
            let mut state = self.state.lock();
            let ring = self.ring.snapshot();
            let moves = plan_rebalance(&state, &ring, &self.config);
            if moves.is_empty() {
                return report;
            }
            for mv in &moves {
                state.table.in_transition.insert(mv.key.clone());
            }
            self.publish(&mut state);
            moves
        };
        info!(planned = moves.len(), "rebalance started");

        if let Err(e) = announce(self.snapshot()).await {
            let reason = e.to_string();
            warn!(error = %reason, "in-transition marks not announced; rebalance aborted");
            let mut state = self.state.lock();
            for mv in &moves {
                state.table.in_transition.remove(&mv.key);
            }
            self.publish(&mut state);
            drop(state);
            report.aborted = moves
                .into_iter()
                .map(|mv| (mv, MigrationError::Announce(reason.clone())))
                .collect();
            return report;
        }

        for mv in moves {
            let outcome = self.migrate_state(&mv).await;
            let mut state = self.state.lock();
            state.table.in_transition.remove(&mv.key);
            match outcome {
                Ok(()) => {
                    let still_valid = state.table.assignments.get(&mv.key) == Some(&mv.from)
                        && state.table.nodes.contains_key(&mv.to);
                    if still_valid {
                        state.set_owner(&mv.key, &mv.to);
                        report.moved.push(mv);
                    } else {
                        debug!(key = %mv.key, "membership changed during migration; move dropped");
                        report.superseded.push(mv);
                    }
                }
                Err(e) => {
                    warn!(key = %mv.key, from = %mv.from, to = %mv.to, error = %e, "migration aborted; key stays with original owner");
                    if matches!(e, MigrationError::Timeout { .. })
                        && let Some(m) = &self.metrics
                    {
                        m.record_migration_timeout();
                    }
                    report.aborted.push((mv, e));
                }
            }
        }

        let mut state = self.state.lock();
        self.publish(&mut state);
        drop(state);

        if let Some(m) = &self.metrics {
            m.record_keys_moved(report.moved.len());
        }
        info!(
            moved = report.moved.len(),
            aborted = report.aborted.len(),
            superseded = report.superseded.len(),
            "rebalance finished"
        );
        report
    }

    /// Replace all state with a previously published table, e.g. when a new
    /// leader takes over. Pending transitions are dropped, leaving those keys
    /// with their recorded owner.
    pub fn restore(&self, table: &AssignmentTable) {
        let mut state = self.state.lock();
        let mut next = ClusterState::empty();
        next.table.version = table.version.max(state.table.version);

        for (id, load) in table.nodes.iter() {
            next.table.nodes.insert(
                id.clone(),
                NodeLoad {
                    capacity: load.capacity.max(1),
                    current_load: 0,
                },
            );
            next.keys_by_node.entry(id.clone()).or_default();
        }
        for (key, owner) in table.assignments.iter() {
            if next.table.nodes.contains_key(owner) {
                next.set_owner(key, owner);
            }
        }

        let current = self.ring.snapshot();
        for id in current.nodes() {
            if !next.table.nodes.contains_key(id) {
                self.ring.remove_node(id);
            }
        }
        for id in next.table.nodes.keys() {
            self.ring.add_node(id);
        }
        *state = next;
        info!(version = state.table.version, keys = state.table.assignments.len(), "assignment table restored");
        self.publish(&mut state);
    }

    async fn migrate_state(&self, mv: &KeyMove) -> Result<(), MigrationError> {
        let Some(sync) = &self.state_sync else {
            return Ok(());
        };
        match tokio::time::timeout(
            self.config.migration_timeout,
            sync.migrate(&mv.key, &mv.from, &mv.to),
        )
        .await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(MigrationError::Store(e)),
            Err(_) => Err(MigrationError::Timeout {
                key: mv.key.clone(),
                from: mv.from.clone(),
                to: mv.to.clone(),
                timeout: self.config.migration_timeout,
            }),
        }
    }

    fn publish(&self, state: &mut ClusterState) {
        state.table.version += 1;
        self.published.store(Arc::new(state.table.clone()));
        if let Some(m) = &self.metrics {
            for (id, load) in state.table.nodes.iter() {
                m.set_keys_assigned(id, load.current_load);
            }
        }
    }
}

/// Compare `a.load/a.capacity` with `b.load/b.capacity` exactly.
fn compare_ratio(a: &NodeLoad, b: &NodeLoad) -> Ordering {
    let lhs = a.current_load as u128 * b.capacity.max(1) as u128;
    let rhs = b.current_load as u128 * a.capacity.max(1) as u128;
    lhs.cmp(&rhs)
}

/// Compute the key moves for one rebalance round.
///
/// Most-loaded = highest ratio, least-loaded = lowest ratio; ties on either side
/// go to the lexicographically smallest node id. Each pair transfer is
/// `ceil((load_a + load_b) / 2) - load_b`, bounded so neither node crosses its
/// share of the cluster-mean ratio.
fn plan_rebalance(state: &ClusterState, ring: &HashRing, config: &PlacementConfig) -> Vec<KeyMove> {
    let mut loads: BTreeMap<String, NodeLoad> = state
        .table
        .nodes
        .iter()
        .map(|(id, l)| (id.clone(), *l))
        .collect();
    if loads.len() < 2 {
        return Vec::new();
    }
    let total_load: usize = loads.values().map(|l| l.current_load).sum();
    let total_capacity: usize = loads.values().map(|l| l.capacity.max(1)).sum();
    let mean_ratio = total_load as f64 / total_capacity as f64;
    let share = |l: &NodeLoad| (mean_ratio * l.capacity as f64).round() as usize;

    let mut taken: BTreeSet<String> = BTreeSet::new();
    let mut moves = Vec::new();
    let max_rounds = loads.len() * loads.len() * 4;

    for _ in 0..max_rounds {
        // BTreeMap iteration is id-ordered, so strict comparisons keep the smallest id on ties.
        let mut most: Option<(&String, &NodeLoad)> = None;
        let mut least: Option<(&String, &NodeLoad)> = None;
        for (id, l) in &loads {
            if most.is_none_or(|(_, m)| compare_ratio(l, m) == Ordering::Greater) {
                most = Some((id, l));
            }
            if least.is_none_or(|(_, m)| compare_ratio(l, m) == Ordering::Less) {
                least = Some((id, l));
            }
        }
        let (Some((a_id, a)), Some((b_id, b))) = (most, least) else {
            break;
        };
        if a_id == b_id || a.ratio() - b.ratio() <= config.rebalance_threshold {
            break;
        }

        let pair_transfer = (a.current_load + b.current_load).div_ceil(2).saturating_sub(b.current_load);
        let surplus = a.current_load.saturating_sub(share(a));
        let deficit = share(b).saturating_sub(b.current_load);
        let wanted = pair_transfer.min(surplus).min(deficit);
        if wanted == 0 {
            break;
        }

        let (a_id, b_id) = (a_id.clone(), b_id.clone());
        let keys = pick_keys(state, ring, config, &a_id, &b_id, &taken, wanted);
        if keys.is_empty() {
            break;
        }
        debug!(from = %a_id, to = %b_id, keys = keys.len(), "rebalance pair");
        let n = keys.len();
        for key in keys {
            taken.insert(key.clone());
            moves.push(KeyMove {
                key,
                from: a_id.clone(),
                to: b_id.clone(),
            });
        }
        if let Some(l) = loads.get_mut(&a_id) {
            l.current_load -= n;
        }
        if let Some(l) = loads.get_mut(&b_id) {
            l.current_load += n;
        }
    }
    moves
}

/// Keys of `from` to hand to `to`: keys that already list `to` among their ring
/// successors first, then ascending key order. Keys mid-migration are skipped.
fn pick_keys(
    state: &ClusterState,
    ring: &HashRing,
    config: &PlacementConfig,
    from: &str,
    to: &str,
    taken: &BTreeSet<String>,
    wanted: usize,
) -> Vec<String> {
    let Some(owned) = state.keys_by_node.get(from) else {
        return Vec::new();
    };
    let available = owned
        .iter()
        .filter(|k| !taken.contains(*k) && !state.table.in_transition.contains(*k));
    let (mut preferred, mut rest): (Vec<&String>, Vec<&String>) = available
        .partition(|k| ring.replicas(k, config.replica_candidates).iter().any(|r| r == to));
    preferred.append(&mut rest);
    preferred.into_iter().take(wanted).cloned().collect()
}
