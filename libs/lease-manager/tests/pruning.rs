mod common;

use chrono::TimeDelta;
use common::Harness;
use lease_manager::{AcquireRequest, PruneStats, Reconciled, Reconciler, keys};
use resource_store::ResourceStore;

fn request(networks: u32) -> AcquireRequest {
    AcquireRequest {
        vcpus: 4,
        memory: 16,
        pool: None,
        networks,
    }
}

#[tokio::test]
async fn test_expired_lease_is_deleted() {
    let h = Harness::new();
    let lease = h.manager.service.acquire("alice", request(1)).await.unwrap();
    let created = lease.meta.creation_timestamp.unwrap();

    // not expired yet, still inside the reminder window
    let stats = h.manager.pruner.sweep_at(created + TimeDelta::hours(7)).await;
    assert_eq!(stats.pruned, 0);

    let stats = h
        .manager
        .pruner
        .sweep_at(created + TimeDelta::hours(8) + TimeDelta::minutes(1))
        .await;
    assert_eq!(
        stats,
        PruneStats {
            warned: 0,
            pruned: 1,
            failed: 0
        }
    );
    assert!(h.lease(lease.name()).await.meta.is_deleting());

    // the deletion goes through the reconciler
    let outcome = h.manager.reconciler.reconcile(lease.name()).await.unwrap();
    assert_eq!(outcome, Reconciled::Finalized);
    assert!(h.try_lease(lease.name()).await.is_none());
    assert!(!h.manager.cache.has_active_lease("alice"));
}

#[tokio::test]
async fn test_expiry_reminder() {
    let h = Harness::new();
    let lease = h.manager.service.acquire("bob", request(1)).await.unwrap();
    let created = lease.meta.creation_timestamp.unwrap();
    let pruner = &h.manager.pruner;

    let at = created + TimeDelta::hours(7) + TimeDelta::minutes(30);
    assert_eq!(pruner.sweep_at(at).await.warned, 1);
    let messages = h.fakes.messages_to("bob");
    assert_eq!(messages.len(), 1);
    assert!(messages[0].starts_with("your lease will expire at"));
    assert!(messages[0].ends_with("you can renew your lease up to 3 times."));

    // only once per expiration
    assert_eq!(pruner.sweep_at(at + TimeDelta::minutes(1)).await.warned, 0);

    // renewing moves the expiration, the reminder fires again
    h.manager.service.renew("bob").await.unwrap();
    let stats = pruner
        .sweep_at(created + TimeDelta::hours(15) + TimeDelta::minutes(30))
        .await;
    assert_eq!(stats.warned, 1);
    assert_eq!(stats.pruned, 0);
    assert_eq!(h.fakes.messages_to("bob").len(), 2);
}

#[tokio::test]
async fn test_failed_reminder_is_retried() {
    let h = Harness::new();
    let lease = h.manager.service.acquire("carol", request(1)).await.unwrap();
    let at = lease.meta.creation_timestamp.unwrap() + TimeDelta::hours(7) + TimeDelta::minutes(30);

    h.fakes.set_fail_messages(true);
    assert_eq!(h.manager.pruner.sweep_at(at).await.warned, 0);
    h.fakes.set_fail_messages(false);
    assert_eq!(h.manager.pruner.sweep_at(at).await.warned, 1);
}

#[tokio::test]
async fn test_pruning_can_be_disabled() {
    let h = Harness::new();
    let lease = h.manager.service.acquire("dave", request(1)).await.unwrap();
    let mut stored = h.lease(lease.name()).await;
    stored
        .meta
        .annotations
        .insert(keys::DISABLE_PRUNING.into(), "true".into());
    h.store.update(stored).await.unwrap();
    h.manager.reconciler.reconcile(lease.name()).await.unwrap();

    let far = lease.meta.creation_timestamp.unwrap() + TimeDelta::days(30);
    assert_eq!(h.manager.pruner.sweep_at(far).await, PruneStats::default());
    assert!(!h.lease(lease.name()).await.meta.is_deleting());
    assert!(h.fakes.messages_to("dave").is_empty());
}

#[tokio::test]
async fn test_network_only_companion_expires_too() {
    let h = Harness::new();
    let lease = h.manager.service.acquire("erin", request(2)).await.unwrap();
    // the companion reaches the cache through the reconciler
    h.manager.reconciler.resync().await.unwrap();
    assert_eq!(h.manager.cache.len(), 2);

    let far = lease.meta.creation_timestamp.unwrap() + TimeDelta::hours(9);
    assert_eq!(h.manager.pruner.sweep_at(far).await.pruned, 2);
}
