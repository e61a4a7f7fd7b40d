use std::collections::HashSet;
use std::convert::Infallible;
use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shoal::assignment::{AssignmentError, AssignmentTable, MigrationError, PlacementConfig, PodAssignmentManager};
use shoal::state_sync::{
    MemoryStateStore, StateConfig, StateEntry, StateKey, StateStore, StateStoreError, StateSynchronizer,
};
use shoal::work_item::ComputationType;

fn manager() -> PodAssignmentManager {
    PodAssignmentManager::new(PlacementConfig::default())
}

fn assert_consistent(table: &AssignmentTable) {
    let mut total = 0;
    for (id, load) in table.nodes.iter() {
        let owned = table.keys_of(id).len();
        assert_eq!(owned, load.current_load, "load counter for {id} out of sync");
        total += owned;
    }
    assert_eq!(total, table.len(), "keys owned by unknown nodes");
    assert!(table.in_transition.is_empty(), "keys left in transition");
}

#[shoal::test]
fn assign_is_idempotent() {
    let m = manager();
    m.register_node("a", 10).unwrap();
    m.register_node("b", 10).unwrap();
    let first = m.assign("NSE:RELIANCE").unwrap();
    for _ in 0..10 {
        assert_eq!(m.assign("NSE:RELIANCE").unwrap(), first);
    }
    assert_eq!(m.snapshot().len(), 1);
    assert_consistent(&m.snapshot());
}

#[shoal::test]
fn duplicate_node_is_rejected() {
    let m = manager();
    m.register_node("a", 10).unwrap();
    assert!(matches!(m.register_node("a", 10), Err(AssignmentError::DuplicateNode(_))));
}

#[shoal::test]
async fn unregistering_unknown_node_fails() {
    let m = manager();
    assert!(matches!(
        m.unregister_node("ghost").await,
        Err(AssignmentError::UnknownNode(_))
    ));
}

#[shoal::test]
fn no_nodes_means_no_eligible_node() {
    let m = manager();
    match m.assign("k") {
        Err(AssignmentError::NoEligibleNode { key }) => assert_eq!(key, "k"),
        other => panic!("unexpected {other:?}"),
    }
}

#[shoal::test]
fn saturated_nodes_take_no_new_keys() {
    let m = manager();
    m.register_node("a", 10).unwrap();
    // 9/10 is the saturation point.
    for i in 0..9 {
        assert_eq!(m.assign(&format!("k{i}")).unwrap(), "a");
    }
    assert!(matches!(m.assign("k9"), Err(AssignmentError::NoEligibleNode { .. })));
}

#[shoal::test]
fn falls_back_to_any_unsaturated_node() {
    // Only three of the four nodes are ring candidates for any key; once
    // those fill up the key has to land on the remaining one.
    let m = manager();
    for id in ["a", "b", "c", "d"] {
        m.register_node(id, 4).unwrap();
    }
    for i in 0..16 {
        if let Err(e) = m.assign(&format!("key-{i}")) {
            panic!("key-{i}: {e}");
        }
    }
    let table = m.snapshot();
    // 3/4 is still below 0.9, so every node fills to 4.
    for id in ["a", "b", "c", "d"] {
        assert_eq!(table.node(id).unwrap().current_load, 4);
    }
    assert!(matches!(m.assign("one-more"), Err(AssignmentError::NoEligibleNode { .. })));
    assert_consistent(&table);
}

#[shoal::test]
fn prefers_least_loaded_ring_candidate() {
    let m = manager();
    m.register_node("a", 100).unwrap();
    m.register_node("b", 100).unwrap();
    m.register_node("c", 100).unwrap();
    for i in 0..90 {
        m.assign(&format!("key-{i}")).unwrap();
    }
    // Three candidates out of three nodes: placement is purely by load.
    let table = m.snapshot();
    for id in ["a", "b", "c"] {
        assert_eq!(table.node(id).unwrap().current_load, 30);
    }
}

#[shoal::test]
async fn unregister_spreads_orphans_across_survivors() {
    let m = manager();
    for id in ["a", "b", "c", "d"] {
        m.register_node(id, 1000).unwrap();
    }
    for i in 0..400 {
        m.assign(&format!("key-{i}")).unwrap();
    }
    let orphans: HashSet<String> = m.snapshot().keys_of("b").into_iter().collect();
    assert!(!orphans.is_empty());

    let report = m.unregister_node("b").await.unwrap();
    assert_eq!(report.reassigned.len(), orphans.len());
    assert!(report.unassigned.is_empty());

    let table = m.snapshot();
    let targets: HashSet<&str> = report.reassigned.iter().map(|mv| mv.to.as_str()).collect();
    assert!(targets.len() > 1, "orphans were bulk-assigned to one node");
    assert!(!targets.contains("b"));
    for key in &orphans {
        assert_ne!(table.owner(key), Some("b"));
        assert!(table.owner(key).is_some());
    }
    assert!(table.node("b").is_none());
    assert_consistent(&table);
}

#[shoal::test]
async fn rebalance_is_noop_within_threshold() {
    let m = manager();
    m.register_node("a", 100).unwrap();
    for i in 0..20 {
        m.assign(&format!("key-{i}")).unwrap();
    }
    m.register_node("b", 100).unwrap();
    // a = 0.2, b = 0.0: within the 0.3 threshold
    let report = m.rebalance().await;
    assert!(report.moved.is_empty());
    assert_eq!(m.snapshot().node("a").unwrap().current_load, 20);
}

#[shoal::test]
async fn rebalance_moves_keys_to_new_node() {
    let m = manager();
    m.register_node("a", 100).unwrap();
    m.register_node("b", 100).unwrap();
    for i in 0..160 {
        m.assign(&format!("key-{i}")).unwrap();
    }
    m.register_node("c", 100).unwrap();

    let report = m.rebalance().await;
    assert!(report.aborted.is_empty());
    let table = m.snapshot();
    let c = table.node("c").unwrap().current_load;
    assert_eq!(c, report.moved.len());
    assert!(report.moved.iter().all(|mv| mv.to == "c"));
    // cluster mean is 160/300; every node ends near 53
    for id in ["a", "b", "c"] {
        let load = table.node(id).unwrap().current_load as i64;
        assert!((load - 53).abs() <= 1, "{id} has {load}");
    }
    assert_consistent(&table);

    // A second pass finds nothing to do.
    assert!(m.rebalance().await.moved.is_empty());
}

fn loaded_pair() -> PodAssignmentManager {
    let m = manager();
    m.register_node("a", 100).unwrap();
    for i in 0..60 {
        m.assign(&format!("key-{i}")).unwrap();
    }
    m.register_node("b", 100).unwrap();
    m
}

#[shoal::test]
async fn rebalance_announces_marks_before_moving() {
    let m = loaded_pair();
    let mut announced = None;
    let report = m
        .rebalance_announced(|table| {
            announced = Some(table);
            ready(Ok::<(), Infallible>(()))
        })
        .await;
    let announced = announced.expect("rebalance never announced its marks");

    assert_eq!(report.moved.len(), 30);
    assert_eq!(announced.in_transition.len(), report.moved.len());
    for mv in &report.moved {
        // Marked, but not yet flipped, when the cluster is told.
        assert!(announced.is_in_transition(&mv.key));
        assert_eq!(announced.owner(&mv.key), Some("a"));
    }
    assert!(announced.version < m.snapshot().version);
    assert_consistent(&m.snapshot());
}

#[shoal::test]
async fn failed_announcement_aborts_rebalance() {
    let m = loaded_pair();
    let report = m.rebalance_announced(|_| ready(Err::<(), _>("store down"))).await;

    assert!(report.moved.is_empty());
    assert_eq!(report.aborted.len(), 30);
    assert!(
        report
            .aborted
            .iter()
            .all(|(_, e)| matches!(e, MigrationError::Announce(_)))
    );
    let table = m.snapshot();
    assert_eq!(table.keys_of("a").len(), 60);
    assert_consistent(&table);
}

#[shoal::test]
async fn unregister_announces_reassigned_keys_in_transition() {
    let m = manager();
    for id in ["a", "b", "c"] {
        m.register_node(id, 1000).unwrap();
    }
    for i in 0..90 {
        m.assign(&format!("key-{i}")).unwrap();
    }
    let orphans = m.snapshot().keys_of("b");

    let mut announced = None;
    let report = m
        .unregister_node_announced("b", |table| {
            announced = Some(table);
            ready(Ok::<(), Infallible>(()))
        })
        .await
        .unwrap();
    let announced = announced.expect("unregister never announced its marks");

    assert_eq!(announced.in_transition.len(), orphans.len());
    for mv in &report.reassigned {
        assert!(announced.is_in_transition(&mv.key));
        assert_eq!(announced.owner(&mv.key), Some(mv.to.as_str()));
    }
    assert_consistent(&m.snapshot());
}

#[shoal::test]
async fn rebalance_tie_break_prefers_smallest_node_id() {
    let m = manager();
    m.register_node("b", 100).unwrap();
    m.register_node("a", 100).unwrap();
    for i in 0..120 {
        m.assign(&format!("key-{i}")).unwrap();
    }
    m.register_node("z", 100).unwrap();
    m.register_node("y", 100).unwrap();

    let report = m.rebalance().await;
    // First pair: most loaded "a" (tie with "b"), least loaded "y" (tie with "z").
    let first = &report.moved[0];
    assert_eq!(first.from, "a");
    assert_eq!(first.to, "y");
}

#[shoal::test]
async fn rebalance_migrates_state_to_new_owner() {
    let store = Arc::new(MemoryStateStore::new());
    let sync = StateSynchronizer::new("leader", store.clone(), StateConfig::default());
    let m = PodAssignmentManager::new(PlacementConfig::default()).with_state_sync(sync);
    m.register_node("a", 10).unwrap();
    for i in 0..8 {
        m.assign(&format!("key-{i}")).unwrap();
    }
    let greeks = ComputationType::from("greeks");
    let writer = StateSynchronizer::new("a", store.clone(), StateConfig::default());
    for i in 0..8 {
        writer.save(&format!("key-{i}"), &greeks, vec![i as u8]).await.unwrap();
    }

    m.register_node("b", 10).unwrap();
    let report = m.rebalance().await;
    assert!(!report.moved.is_empty());
    for mv in &report.moved {
        let entry = store
            .get(&StateKey::new(mv.key.clone(), greeks.clone()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.owner_hint.as_deref(), Some("b"));
        let provenance = entry.provenance.unwrap();
        assert_eq!(provenance.from, "a");
        assert_eq!(provenance.to, "b");
    }
}

/// State store whose calls never complete.
struct HangingStore;

#[async_trait]
impl StateStore for HangingStore {
    async fn put(&self, _: &StateKey, _: StateEntry, _: Duration) -> Result<(), StateStoreError> {
        std::future::pending().await
    }
    async fn get(&self, _: &StateKey) -> Result<Option<StateEntry>, StateStoreError> {
        std::future::pending().await
    }
    async fn entries_for(&self, _: &str) -> Result<Vec<(StateKey, StateEntry)>, StateStoreError> {
        std::future::pending().await
    }
    async fn delete(&self, _: &StateKey) -> Result<(), StateStoreError> {
        std::future::pending().await
    }
}

#[shoal::test(start_paused = true)]
async fn migration_timeout_leaves_key_with_original_owner() {
    let state = StateConfig {
        ttl: Duration::from_secs(300),
        op_timeout: Duration::from_secs(60),
    };
    let sync = StateSynchronizer::new("leader", Arc::new(HangingStore), state);
    let config = PlacementConfig {
        migration_timeout: Duration::from_millis(200),
        ..PlacementConfig::default()
    };
    let m = PodAssignmentManager::new(config).with_state_sync(sync);
    m.register_node("a", 10).unwrap();
    for i in 0..8 {
        m.assign(&format!("key-{i}")).unwrap();
    }
    m.register_node("b", 10).unwrap();

    let report = m.rebalance().await;
    assert!(report.moved.is_empty());
    assert!(!report.aborted.is_empty());
    for (mv, err) in &report.aborted {
        assert!(matches!(err, MigrationError::Timeout { .. }));
        assert_eq!(m.owner(&mv.key).as_deref(), Some("a"));
    }
    let table = m.snapshot();
    assert_eq!(table.node("a").unwrap().current_load, 8);
    assert_consistent(&table);
}

#[shoal::test]
async fn restore_rebuilds_ring_and_loads() {
    let m = manager();
    for id in ["a", "b", "c"] {
        m.register_node(id, 50).unwrap();
    }
    for i in 0..60 {
        m.assign(&format!("key-{i}")).unwrap();
    }
    let published = m.snapshot();

    let fresh = manager();
    fresh.register_node("stale", 5).unwrap();
    fresh.restore(&published);
    let table = fresh.snapshot();
    assert!(table.version > published.version);
    assert!(table.node("stale").is_none());
    assert_eq!(table.assignments, published.assignments);
    assert_eq!(fresh.ring().len(), 3);
    for (id, load) in published.nodes.iter() {
        assert_eq!(table.node(id), Some(load));
    }
    assert_consistent(&table);
}

#[shoal::test]
fn table_round_trips_through_json() {
    let m = manager();
    m.register_node("a", 5).unwrap();
    m.assign("k").unwrap();
    let table = m.snapshot();
    let json = serde_json::to_vec(table.as_ref()).unwrap();
    let back: AssignmentTable = serde_json::from_slice(&json).unwrap();
    assert_eq!(&back, table.as_ref());
}
