use std::time::Duration;

use shoal::coordination::{CoordinationError, CoordinationStore, MemoryStore, bounded, keys};

#[shoal::test(start_paused = true)]
async fn leased_keys_vanish_when_the_lease_expires() {
    let store = MemoryStore::new();
    let lease = store.grant_lease(Duration::from_secs(5)).await.unwrap();
    store.put("c/members/a", b"a".to_vec(), Some(lease)).await.unwrap();
    store.put("c/assignments", b"{}".to_vec(), None).await.unwrap();

    tokio::time::advance(Duration::from_secs(4)).await;
    assert!(store.get("c/members/a").await.unwrap().is_some());

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(store.get("c/members/a").await.unwrap().is_none());
    assert!(store.get("c/assignments").await.unwrap().is_some());
    assert_eq!(store.lease_count(), 0);
    assert!(matches!(
        store.keep_alive(lease).await,
        Err(CoordinationError::LeaseExpired(id)) if id == lease
    ));
}

#[shoal::test(start_paused = true)]
async fn keep_alive_extends_for_a_full_ttl() {
    let store = MemoryStore::new();
    let lease = store.grant_lease(Duration::from_secs(3)).await.unwrap();
    store.put("k", vec![1], Some(lease)).await.unwrap();
    for _ in 0..5 {
        tokio::time::advance(Duration::from_secs(2)).await;
        store.keep_alive(lease).await.unwrap();
    }
    assert!(store.get("k").await.unwrap().is_some());
}

#[shoal::test]
async fn create_if_absent_has_a_single_winner() {
    let store = MemoryStore::new();
    let a = store.grant_lease(Duration::from_secs(5)).await.unwrap();
    let b = store.grant_lease(Duration::from_secs(5)).await.unwrap();
    assert!(store.create_if_absent("c/leader", b"a".to_vec(), Some(a)).await.unwrap());
    assert!(!store.create_if_absent("c/leader", b"b".to_vec(), Some(b)).await.unwrap());

    let entry = store.get("c/leader").await.unwrap().unwrap();
    assert_eq!(entry.value, b"a");
    assert_eq!(entry.lease, Some(a));

    // Revoking the winner frees the key for the next contender.
    store.revoke_lease(a).await.unwrap();
    assert!(store.create_if_absent("c/leader", b"b".to_vec(), Some(b)).await.unwrap());
}

#[shoal::test]
async fn writes_with_a_dead_lease_are_rejected() {
    let store = MemoryStore::new();
    let lease = store.grant_lease(Duration::from_secs(5)).await.unwrap();
    store.revoke_lease(lease).await.unwrap();
    assert!(matches!(
        store.put("k", vec![], Some(lease)).await,
        Err(CoordinationError::LeaseExpired(_))
    ));
    assert!(matches!(
        store.create_if_absent("k", vec![], Some(lease)).await,
        Err(CoordinationError::LeaseExpired(_))
    ));
    assert!(store.get("k").await.unwrap().is_none());
}

#[shoal::test]
async fn list_prefix_is_ordered_and_bounded() {
    let store = MemoryStore::new();
    for node in ["c", "a", "b"] {
        store
            .put(&keys::member_key("shoal", node), node.as_bytes().to_vec(), None)
            .await
            .unwrap();
    }
    store.put(&keys::leader_key("shoal"), vec![], None).await.unwrap();
    store.put("shoalx/members/z", vec![], None).await.unwrap();

    let prefix = keys::members_prefix("shoal");
    let listed = store.list_prefix(&prefix).await.unwrap();
    let ids: Vec<&str> = listed
        .iter()
        .filter_map(|e| keys::suffix(&prefix, &e.key))
        .collect();
    assert_eq!(ids, vec!["a", "b", "c"]);

    // Revisions increase with every write.
    assert!(listed.windows(2).all(|w| w[0].key < w[1].key));
    let c = store.get(&keys::member_key("shoal", "c")).await.unwrap().unwrap();
    let a = store.get(&keys::member_key("shoal", "a")).await.unwrap().unwrap();
    assert!(c.mod_revision < a.mod_revision);
}

#[shoal::test]
async fn delete_reports_whether_a_key_existed() {
    let store = MemoryStore::new();
    store.put("k", vec![1], None).await.unwrap();
    assert!(store.delete("k").await.unwrap());
    assert!(!store.delete("k").await.unwrap());
}

#[shoal::test]
async fn outage_fails_every_call() {
    let store = MemoryStore::new();
    store.put("k", vec![1], None).await.unwrap();
    store.set_available(false);
    assert!(matches!(
        store.get("k").await,
        Err(CoordinationError::RegistryUnavailable(_))
    ));
    assert!(matches!(
        store.grant_lease(Duration::from_secs(1)).await,
        Err(CoordinationError::RegistryUnavailable(_))
    ));
    store.set_available(true);
    assert_eq!(store.get("k").await.unwrap().unwrap().value, vec![1]);
}

#[shoal::test(start_paused = true)]
async fn bounded_turns_a_hang_into_unavailable() {
    let res: Result<(), CoordinationError> =
        bounded(Duration::from_millis(100), std::future::pending()).await;
    assert!(matches!(res, Err(CoordinationError::RegistryUnavailable(_))));

    let ok = bounded(Duration::from_millis(100), async { Ok::<_, CoordinationError>(7) }).await;
    assert_eq!(ok.unwrap(), 7);
}

#[shoal::test]
fn key_layout() {
    assert_eq!(keys::leader_key("prod"), "prod/leader");
    assert_eq!(keys::member_key("prod", "node-1"), "prod/members/node-1");
    assert_eq!(keys::metrics_key("prod", "node-1"), "prod/metrics/node-1");
    assert_eq!(keys::pending_key("prod", "NSE:TCS"), "prod/pending/NSE:TCS");
    assert_eq!(keys::assignments_key("prod"), "prod/assignments");
    assert_eq!(keys::suffix("prod/members/", "prod/members/"), None);
    assert_eq!(keys::suffix("prod/members/", "prod/leader"), None);
}
