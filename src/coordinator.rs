//! Lease-based leader election and cluster membership.
//!
//! Each node runs three loops against the coordination store:
//!
//! - **election**: a FOLLOWER tries an atomic create-if-absent of the leader
//!   key bound to a short lease; the winner becomes LEADER and renews at
//!   `TTL/2`. A failed renewal abdicates immediately.
//! - **presence**: every node keeps its own member record alive under a
//!   separate lease and reports its [`NodeMetrics`] bound to that lease.
//! - **leader cycle**: only while LEADER, reconcile membership with the
//!   [`PodAssignmentManager`], aggregate metrics into the
//!   [`BackpressureMonitor`], place pending keys, rebalance and publish the
//!   assignment table.
//!
//! A node believes it is leader only until `last successful renewal request +
//! TTL`, measured from *before* the request was sent. The store cannot expire
//! the lease earlier than that, so no two nodes ever consider themselves
//! leader at the same instant.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::assignment::{AssignmentTable, PodAssignmentManager};
use crate::backpressure::{BackpressureMonitor, MetricsSource, NodeMetrics, ScalingRecommendation};
use crate::coordination::{
    CoordinationError, CoordinationStore, LeaseId, MemberInfo, bounded, get_hostname, keys,
};
use crate::metrics::Metrics;
use crate::retry::{Backoff, RetryPolicy, jitter};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub node_id: String,
    /// Keys this node accepts, published in its member record
    pub capacity: usize,
    pub cluster_prefix: String,
    pub leader_lease_ttl: Duration,
    pub presence_ttl: Duration,
    /// Deadline for each individual store call
    pub store_timeout: Duration,
    pub cycle_interval: Duration,
    pub metrics_report_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_id: "node".to_string(),
            capacity: 1000,
            cluster_prefix: "shoal".to_string(),
            leader_lease_ttl: Duration::from_secs(5),
            presence_ttl: Duration::from_secs(10),
            store_timeout: Duration::from_secs(1),
            cycle_interval: Duration::from_secs(1),
            metrics_report_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "FOLLOWER"),
            Role::Leader => write!(f, "LEADER"),
        }
    }
}

struct LeaderLease {
    lease: LeaseId,
    valid_until: Instant,
}

pub struct DistributedCoordinator {
    config: CoordinatorConfig,
    store: Arc<dyn CoordinationStore>,
    assignments: Arc<PodAssignmentManager>,
    monitor: Arc<BackpressureMonitor>,
    metrics_source: Arc<dyn MetricsSource>,
    metrics: Option<Metrics>,
    startup_time_ms: i64,

    leader: Mutex<Option<LeaderLease>>,
    presence_lease: Mutex<Option<LeaseId>>,
    /// Last table read from the store; what followers route by
    follower_table: ArcSwap<AssignmentTable>,
    last_published_version: AtomicU64,
    degraded: AtomicBool,

    role_tx: watch::Sender<Role>,
    recommendation_tx: watch::Sender<ScalingRecommendation>,
    shutdown_tx: watch::Sender<bool>,
}

impl DistributedCoordinator {
    /// Register this node's presence and spawn the coordination loops.
    ///
    /// Fails if the initial member record cannot be written.
    pub async fn start(
        config: CoordinatorConfig,
        store: Arc<dyn CoordinationStore>,
        assignments: Arc<PodAssignmentManager>,
        monitor: Arc<BackpressureMonitor>,
        metrics_source: Arc<dyn MetricsSource>,
        metrics: Option<Metrics>,
    ) -> Result<(Arc<Self>, JoinHandle<()>), CoordinationError> {
        if config.store_timeout >= config.leader_lease_ttl / 2 {
            warn!(
                store_timeout = ?config.store_timeout,
                leader_lease_ttl = ?config.leader_lease_ttl,
                "store timeout is not below half the leader lease TTL; renewals may not complete in time"
            );
        }

        let (role_tx, _) = watch::channel(Role::Follower);
        let (recommendation_tx, _) = watch::channel(ScalingRecommendation::None);
        let (shutdown_tx, _) = watch::channel(false);

        let me = Arc::new(Self {
            config,
            store,
            assignments,
            monitor,
            metrics_source,
            metrics,
            startup_time_ms: crate::now_epoch_ms(),
            leader: Mutex::new(None),
            presence_lease: Mutex::new(None),
            follower_table: ArcSwap::from_pointee(AssignmentTable::default()),
            last_published_version: AtomicU64::new(0),
            degraded: AtomicBool::new(false),
            role_tx,
            recommendation_tx,
            shutdown_tx,
        });

        me.heartbeat().await?;
        info!(node_id = %me.config.node_id, "node joined cluster");

        let span = info_span!("coordinator", node_id = %me.config.node_id);
        let election = me.clone().run_election(me.shutdown_tx.subscribe());
        let presence = me.clone().run_presence(me.shutdown_tx.subscribe());
        let cycles = me.clone().run_leader_cycles(me.shutdown_tx.subscribe());
        let handle = tokio::spawn(
            async move {
                tokio::join!(election, presence, cycles);
                debug!("coordinator loops stopped");
            }
            .instrument(span),
        );
        Ok((me, handle))
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// True only while this node holds an unexpired leader lease.
    pub fn is_leader(&self) -> bool {
        self.leader
            .lock()
            .as_ref()
            .is_some_and(|l| Instant::now() < l.valid_until)
    }

    pub fn role(&self) -> Role {
        if self.is_leader() { Role::Leader } else { Role::Follower }
    }

    pub fn subscribe_role(&self) -> watch::Receiver<Role> {
        self.role_tx.subscribe()
    }

    /// Scaling recommendations for the cluster control plane. Only the leader
    /// publishes; the core never provisions nodes itself.
    pub fn subscribe_recommendations(&self) -> watch::Receiver<ScalingRecommendation> {
        self.recommendation_tx.subscribe()
    }

    /// True while the store is unreachable and the last snapshot is served.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn assignments(&self) -> &Arc<PodAssignmentManager> {
        &self.assignments
    }

    pub fn monitor(&self) -> &Arc<BackpressureMonitor> {
        &self.monitor
    }

    /// The assignment snapshot this node routes by.
    pub fn table(&self) -> Arc<AssignmentTable> {
        if self.is_leader() {
            self.assignments.snapshot()
        } else {
            self.follower_table.load_full()
        }
    }

    /// Ask the leader to place `key` on its next cycle.
    pub async fn request_assignment(&self, key: &str) -> Result<(), CoordinationError> {
        let pending = keys::pending_key(&self.config.cluster_prefix, key);
        let created = bounded(
            self.config.store_timeout,
            self.store
                .create_if_absent(&pending, self.config.node_id.as_bytes().to_vec(), None),
        )
        .await?;
        if created {
            debug!(key = %key, "assignment requested from leader");
        }
        Ok(())
    }

    /// Stop all loops, give up leadership and withdraw the member record.
    pub async fn shutdown(&self) -> Result<(), CoordinationError> {
        let _ = self.shutdown_tx.send(true);
        let leader_lease = self.leader.lock().take().map(|l| l.lease);
        if let Some(lease) = leader_lease {
            self.set_role(Role::Follower);
            if let Err(e) = bounded(self.config.store_timeout, self.store.revoke_lease(lease)).await {
                warn!(error = %e, "failed to revoke leader lease on shutdown");
            }
        }
        let presence = self.presence_lease.lock().take();
        if let Some(lease) = presence {
            bounded(self.config.store_timeout, self.store.revoke_lease(lease)).await?;
        }
        info!(node_id = %self.config.node_id, "coordinator shut down");
        Ok(())
    }

    /// Stop all loops without releasing anything, as if the process died.
    /// Leases then expire on their own.
    pub fn crash(&self) {
        let _ = self.shutdown_tx.send(true);
        warn!(node_id = %self.config.node_id, "coordinator halted without releasing leases");
    }

    // ---- election ----

    async fn run_election(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let renew_interval = self.config.leader_lease_ttl / 2;
        let poll_interval = self.config.leader_lease_ttl / 4;
        let mut backoff = Backoff::new(RetryPolicy::registry());

        loop {
            if *shutdown.borrow() {
                break;
            }
            let holding = self.leader.lock().is_some();
            let wait = if holding {
                match self.renew().await {
                    Ok(()) => renew_interval,
                    Err(e) => {
                        warn!(error = %e, "leader lease renewal failed");
                        self.abdicate().await;
                        jitter(poll_interval)
                    }
                }
            } else {
                match self.try_acquire().await {
                    Ok(true) => {
                        backoff.reset();
                        self.set_degraded(false);
                        self.on_elected().await;
                        renew_interval
                    }
                    Ok(false) => {
                        backoff.reset();
                        self.refresh_follower_table().await;
                        poll_interval + jitter(poll_interval)
                    }
                    Err(e) => {
                        self.note_store_error(&e);
                        self.refresh_follower_table().await;
                        backoff.next_delay().unwrap_or(poll_interval)
                    }
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    async fn try_acquire(&self) -> Result<bool, CoordinationError> {
        let ttl = self.config.leader_lease_ttl;
        let timeout = self.config.store_timeout;
        let started = Instant::now();
        let lease = bounded(timeout, self.store.grant_lease(ttl)).await?;
        let leader_key = keys::leader_key(&self.config.cluster_prefix);
        let created = bounded(
            timeout,
            self.store.create_if_absent(
                &leader_key,
                self.config.node_id.as_bytes().to_vec(),
                Some(lease),
            ),
        )
        .await;

        match created {
            Ok(true) => {
                *self.leader.lock() = Some(LeaderLease {
                    lease,
                    valid_until: started + ttl,
                });
                self.set_role(Role::Leader);
                info!(node_id = %self.config.node_id, lease, "leadership acquired");
                Ok(true)
            }
            Ok(false) => {
                let _ = bounded(timeout, self.store.revoke_lease(lease)).await;
                Ok(false)
            }
            Err(e) => {
                let _ = bounded(timeout, self.store.revoke_lease(lease)).await;
                Err(e)
            }
        }
    }

    async fn renew(&self) -> Result<(), CoordinationError> {
        let lease = self
            .leader
            .lock()
            .as_ref()
            .map(|l| l.lease)
            .ok_or(CoordinationError::NotLeader)?;
        let sent = Instant::now();
        let timeout = self.config.store_timeout;
        bounded(timeout, self.store.keep_alive(lease)).await?;

        let leader_key = keys::leader_key(&self.config.cluster_prefix);
        match bounded(timeout, self.store.get(&leader_key)).await? {
            Some(entry) if entry.lease == Some(lease) => {
                if let Some(l) = self.leader.lock().as_mut() {
                    l.valid_until = sent + self.config.leader_lease_ttl;
                }
                Ok(())
            }
            _ => Err(CoordinationError::LeaseExpired(lease)),
        }
    }

    /// Stop acting as leader right away; releasing the lease is best-effort.
    async fn abdicate(&self) {
        let Some(prev) = self.leader.lock().take() else {
            return;
        };
        self.set_role(Role::Follower);
        warn!(node_id = %self.config.node_id, lease = prev.lease, "abdicated leadership");
        let _ = bounded(self.config.store_timeout, self.store.revoke_lease(prev.lease)).await;
    }

    /// A new leader starts from the canonical published table so it never
    /// mutates from a stale private view.
    async fn on_elected(&self) {
        let key = keys::assignments_key(&self.config.cluster_prefix);
        match bounded(self.config.store_timeout, self.store.get(&key)).await {
            Ok(Some(entry)) => match serde_json::from_slice::<AssignmentTable>(&entry.value) {
                Ok(table) => self.assignments.restore(&table),
                Err(e) => warn!(error = %e, "published assignment table is unreadable; starting empty"),
            },
            Ok(None) => {
                let local = self.follower_table.load_full();
                self.assignments.restore(&local);
            }
            Err(e) => {
                // Fall back to the newest table we saw as a follower.
                self.note_store_error(&e);
                let local = self.follower_table.load_full();
                self.assignments.restore(&local);
            }
        }
        self.last_published_version.store(0, Ordering::SeqCst);
    }

    fn set_role(&self, role: Role) {
        if let Some(m) = &self.metrics {
            m.set_leader(role == Role::Leader);
        }
        self.role_tx.send_if_modified(|current| {
            let changed = *current != role;
            *current = role;
            changed
        });
    }

    // ---- presence ----

    async fn run_presence(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::new(RetryPolicy::registry());
        loop {
            let wait = match self.heartbeat().await {
                Ok(()) => {
                    backoff.reset();
                    self.config.metrics_report_interval
                }
                Err(e) => {
                    self.note_store_error(&e);
                    backoff
                        .next_delay()
                        .unwrap_or(self.config.metrics_report_interval)
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
        }
    }

    /// Refresh the presence lease (re-registering if it was lost) and report
    /// this node's metrics under it.
    async fn heartbeat(&self) -> Result<(), CoordinationError> {
        let timeout = self.config.store_timeout;
        let existing = *self.presence_lease.lock();
        let lease = match existing {
            Some(lease) => match bounded(timeout, self.store.keep_alive(lease)).await {
                Ok(()) => lease,
                Err(CoordinationError::LeaseExpired(_)) => {
                    warn!(node_id = %self.config.node_id, "presence lease expired; re-registering");
                    *self.presence_lease.lock() = None;
                    self.register_presence().await?
                }
                Err(e) => return Err(e),
            },
            None => self.register_presence().await?,
        };

        let sample = self.metrics_source.sample();
        let key = keys::metrics_key(&self.config.cluster_prefix, &self.config.node_id);
        bounded(timeout, self.store.put(&key, serde_json::to_vec(&sample)?, Some(lease))).await?;
        self.set_degraded(false);
        Ok(())
    }

    async fn register_presence(&self) -> Result<LeaseId, CoordinationError> {
        let timeout = self.config.store_timeout;
        let lease = bounded(timeout, self.store.grant_lease(self.config.presence_ttl)).await?;
        let info = MemberInfo {
            node_id: self.config.node_id.clone(),
            capacity: self.config.capacity,
            startup_time_ms: Some(self.startup_time_ms),
            hostname: get_hostname(),
        };
        let key = keys::member_key(&self.config.cluster_prefix, &self.config.node_id);
        bounded(timeout, self.store.put(&key, serde_json::to_vec(&info)?, Some(lease))).await?;
        *self.presence_lease.lock() = Some(lease);
        debug!(node_id = %self.config.node_id, lease, "presence registered");
        Ok(lease)
    }

    // ---- follower view ----

    async fn refresh_follower_table(&self) {
        let key = keys::assignments_key(&self.config.cluster_prefix);
        match bounded(self.config.store_timeout, self.store.get(&key)).await {
            Ok(Some(entry)) => match serde_json::from_slice::<AssignmentTable>(&entry.value) {
                Ok(table) => {
                    let current = self.follower_table.load();
                    if table.version > current.version {
                        debug!(version = table.version, keys = table.len(), "assignment table refreshed");
                        self.follower_table.store(Arc::new(table));
                    }
                    self.set_degraded(false);
                }
                Err(e) => warn!(error = %e, "published assignment table is unreadable"),
            },
            Ok(None) => self.set_degraded(false),
            Err(e) => self.note_store_error(&e),
        }
    }

    fn note_store_error(&self, e: &CoordinationError) {
        match e {
            CoordinationError::RegistryUnavailable(_) | CoordinationError::ConnectionFailed(_) => {
                self.set_degraded(true);
            }
            _ => warn!(error = %e, "coordination store call failed"),
        }
    }

    fn set_degraded(&self, degraded: bool) {
        let was = self.degraded.swap(degraded, Ordering::SeqCst);
        if was == degraded {
            return;
        }
        if let Some(m) = &self.metrics {
            m.set_registry_degraded(degraded);
        }
        if degraded {
            warn!(node_id = %self.config.node_id, "coordination store unreachable; serving last known assignments");
        } else {
            info!(node_id = %self.config.node_id, "coordination store reachable again");
        }
    }

    // ---- leader cycle ----

    async fn run_leader_cycles(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.cycle_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut role = self.role_tx.subscribe();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            if !self.is_leader() {
                continue;
            }
            tokio::select! {
                res = self.leader_cycle() => match res {
                    Ok(()) => {}
                    Err(CoordinationError::NotLeader) => debug!("leader cycle stopped: lease no longer valid"),
                    Err(e) => {
                        self.note_store_error(&e);
                        warn!(error = %e, "leader cycle failed");
                    }
                },
                _ = role.wait_for(|r| *r == Role::Follower) => {
                    warn!("leadership lost during cycle; remaining steps skipped");
                }
            }
        }
    }

    /// One pass of leader-only cluster management.
    #[tracing::instrument(level = "debug", skip(self), fields(node_id = %self.config.node_id))]
    pub async fn leader_cycle(&self) -> Result<(), CoordinationError> {
        let timeout = self.config.store_timeout;
        let prefix = self.config.cluster_prefix.as_str();

        // Membership: live member records versus registered nodes.
        let members = bounded(timeout, self.store.list_prefix(&keys::members_prefix(prefix))).await?;
        let mut live: BTreeMap<String, MemberInfo> = BTreeMap::new();
        for entry in members {
            match serde_json::from_slice::<MemberInfo>(&entry.value) {
                Ok(info) => {
                    live.insert(info.node_id.clone(), info);
                }
                Err(e) => warn!(key = %entry.key, error = %e, "skipping unreadable member record"),
            }
        }
        self.ensure_leader()?;
        let registered = self.assignments.node_ids();
        for departed in registered.iter().filter(|id| !live.contains_key(*id)) {
            match self
                .assignments
                .unregister_node_announced(departed, |table| self.announce_table(table))
                .await
            {
                Ok(report) => info!(
                    node_id = %departed,
                    reassigned = report.reassigned.len(),
                    unassigned = report.unassigned.len(),
                    migration_failures = report.migration_failures.len(),
                    "departed node's keys redistributed"
                ),
                Err(e) => warn!(node_id = %departed, error = %e, "failed to unregister node"),
            }
            self.monitor.remove_node(departed);
        }
        for (id, info) in &live {
            if !registered.contains(id)
                && let Err(e) = self.assignments.register_node(id, info.capacity)
            {
                debug!(node_id = %id, error = %e, "node registration skipped");
            }
        }

        // Backpressure: aggregate every node's latest report.
        let reports = bounded(timeout, self.store.list_prefix(&keys::metrics_prefix(prefix))).await?;
        let metrics_prefix = keys::metrics_prefix(prefix);
        for entry in reports {
            let Some(node_id) = keys::suffix(&metrics_prefix, &entry.key) else {
                continue;
            };
            match serde_json::from_slice::<NodeMetrics>(&entry.value) {
                Ok(m) => {
                    let sample = self.monitor.update(node_id, &m);
                    if let Some(metrics) = &self.metrics {
                        metrics.record_backpressure(&sample);
                    }
                }
                Err(e) => warn!(node_id = %node_id, error = %e, "skipping unreadable metrics report"),
            }
        }
        self.monitor.retain_nodes(live.keys().map(String::as_str));

        self.ensure_leader()?;
        let recommendation = self.monitor.recommendation();
        if let Some(metrics) = &self.metrics {
            metrics.set_scaling_recommendation(&recommendation);
        }
        self.recommendation_tx.send_if_modified(|current| {
            if *current == recommendation {
                return false;
            }
            info!(from = ?*current, to = ?recommendation, "scaling recommendation changed");
            *current = recommendation;
            true
        });

        // Pending placement requests from followers.
        let pending_prefix = keys::pending_prefix(prefix);
        let pending = bounded(timeout, self.store.list_prefix(&pending_prefix)).await?;
        for entry in pending {
            let Some(key) = keys::suffix(&pending_prefix, &entry.key) else {
                continue;
            };
            match self.assignments.assign(key) {
                Ok(owner) => debug!(key = %key, node_id = %owner, "pending key placed"),
                Err(e) => warn!(key = %key, error = %e, "pending key could not be placed"),
            }
            bounded(timeout, self.store.delete(&entry.key)).await?;
        }

        self.ensure_leader()?;
        let report = self
            .assignments
            .rebalance_announced(|table| self.announce_table(table))
            .await;
        if !report.moved.is_empty() || !report.aborted.is_empty() {
            debug!(moved = report.moved.len(), aborted = report.aborted.len(), "rebalance applied");
        }

        self.publish_table().await
    }

    /// Write the current table to the store if it changed since the last write.
    async fn publish_table(&self) -> Result<(), CoordinationError> {
        self.ensure_leader()?;
        let table = self.assignments.snapshot();
        if table.version <= self.last_published_version.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.write_table(table).await
    }

    /// Publish a table carrying `in_transition` marks and hold off until every
    /// follower has had a refresh in which to pick it up. Old owners then
    /// reject and abandon the marked keys before any state moves.
    async fn announce_table(&self, table: Arc<AssignmentTable>) -> Result<(), CoordinationError> {
        let marked = table.in_transition.len();
        self.write_table(table).await?;
        debug!(keys = marked, "in-transition marks announced");
        tokio::time::sleep(self.handoff_grace()).await;
        self.ensure_leader()
    }

    /// Upper bound on a follower's table refresh interval (`poll + jitter(poll)`).
    fn handoff_grace(&self) -> Duration {
        self.config.leader_lease_ttl / 2
    }

    async fn write_table(&self, table: Arc<AssignmentTable>) -> Result<(), CoordinationError> {
        self.ensure_leader()?;
        let key = keys::assignments_key(&self.config.cluster_prefix);
        let value = serde_json::to_vec(table.as_ref())?;
        bounded(self.config.store_timeout, self.store.put(&key, value, None)).await?;
        self.last_published_version
            .fetch_max(table.version, Ordering::SeqCst);
        debug!(version = table.version, keys = table.len(), "assignment table published");
        self.follower_table.store(table);
        Ok(())
    }

    fn ensure_leader(&self) -> Result<(), CoordinationError> {
        if self.is_leader() {
            Ok(())
        } else {
            Err(CoordinationError::NotLeader)
        }
    }
}
