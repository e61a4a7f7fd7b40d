#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use shoal::assignment::{PlacementConfig, PodAssignmentManager};
use shoal::backpressure::{BackpressureConfig, BackpressureMonitor, MetricsSource, NodeMetrics};
use shoal::coordination::{CoordinationStore, MemoryStore};
use shoal::coordinator::{CoordinatorConfig, DistributedCoordinator};
use tokio::task::JoinHandle;

// Helper: enforce a tight timeout for async tests likely to hang
#[macro_export]
macro_rules! with_timeout {
    ($ms:expr, $body:block) => {{
        tokio::time::timeout(std::time::Duration::from_millis($ms), async move { $body })
            .await
            .expect("test timed out")
    }};
}

pub const LEADER_TTL: Duration = Duration::from_secs(2);

pub fn coordinator_config(node_id: &str) -> CoordinatorConfig {
    CoordinatorConfig {
        node_id: node_id.to_string(),
        capacity: 1000,
        cluster_prefix: "test".to_string(),
        leader_lease_ttl: LEADER_TTL,
        presence_ttl: Duration::from_secs(3),
        store_timeout: Duration::from_millis(200),
        cycle_interval: Duration::from_millis(200),
        metrics_report_interval: Duration::from_millis(200),
    }
}

pub fn idle_metrics() -> Arc<dyn MetricsSource> {
    Arc::new(NodeMetrics::default)
}

pub fn overloaded_metrics() -> Arc<dyn MetricsSource> {
    Arc::new(|| NodeMetrics {
        cpu_pct: 100.0,
        mem_pct: 100.0,
        queue_depth: 100,
        queue_capacity: 100,
        p99_latency_ms: 100.0,
        target_latency_ms: 50.0,
    })
}

pub struct ClusterNode {
    pub coordinator: Arc<DistributedCoordinator>,
    pub task: JoinHandle<()>,
}

pub async fn start_coordinator(
    store: &Arc<MemoryStore>,
    config: CoordinatorConfig,
    source: Arc<dyn MetricsSource>,
) -> ClusterNode {
    let assignments = Arc::new(PodAssignmentManager::new(PlacementConfig::default()));
    start_coordinator_with(store, config, source, assignments).await
}

pub async fn start_coordinator_with(
    store: &Arc<MemoryStore>,
    config: CoordinatorConfig,
    source: Arc<dyn MetricsSource>,
    assignments: Arc<PodAssignmentManager>,
) -> ClusterNode {
    let monitor = Arc::new(BackpressureMonitor::new(BackpressureConfig::default()));
    let store: Arc<dyn CoordinationStore> = store.clone();
    let (coordinator, task) =
        DistributedCoordinator::start(config, store, assignments, monitor, source, None)
            .await
            .expect("coordinator start");
    ClusterNode { coordinator, task }
}

pub async fn start_cluster(store: &Arc<MemoryStore>, ids: &[&str]) -> Vec<ClusterNode> {
    let mut nodes = Vec::new();
    for id in ids {
        nodes.push(start_coordinator(store, coordinator_config(id), idle_metrics()).await);
    }
    nodes
}

pub fn leaders(nodes: &[ClusterNode]) -> Vec<usize> {
    nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| n.coordinator.is_leader())
        .map(|(i, _)| i)
        .collect()
}

/// Poll `f` every 50ms until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut f: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if f().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    f().await
}

/// Wait for exactly one leader and return its index.
pub async fn await_leader(nodes: &[ClusterNode], timeout: Duration) -> usize {
    let found = wait_until(timeout, || async { leaders(nodes).len() == 1 }).await;
    assert!(found, "no single leader within {timeout:?}");
    leaders(nodes)[0]
}
