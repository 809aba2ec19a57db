mod common;

use std::time::Duration;

use common::{Call, DOMAIN, Harness, SYSTEMS};
use lease_manager::{AcquireRequest, LeaseExt, Provisioned, Reconciled, keys};
use resource_store::ResourceStore;

fn request(networks: u32) -> AcquireRequest {
    AcquireRequest {
        vcpus: 4,
        memory: 16,
        pool: None,
        networks,
    }
}

/// acquire for `user`, fulfill on `net-1` and reconcile so the lease is queued
async fn fulfilled(h: &mut Harness, user: &str) -> String {
    h.seed_network("net-1", 8).await;
    let lease = h.manager.service.acquire(user, request(1)).await.unwrap();
    h.fulfill(lease.name(), Some("net-1")).await;
    let outcome = h.manager.reconciler.reconcile(lease.name()).await.unwrap();
    assert_eq!(outcome, Reconciled::Live { queued: true });
    assert_eq!(h.queued(), vec![lease.name().to_owned()]);
    lease.name().to_owned()
}

#[tokio::test]
async fn test_fulfilled_lease_is_provisioned_once() {
    let mut h = Harness::new();
    let name = fulfilled(&mut h, "alice").await;

    assert_eq!(h.worker.process(&name).await, Provisioned::Completed);

    let lease = h.lease(&name).await;
    let creds = lease.credentials().unwrap();
    assert_eq!(creds.username, name);
    assert_eq!(creds.password.len(), 20);
    assert!(lease.meta.flag(keys::DETAILS_SENT));
    assert!(!h.manager.cache.is_queued(&name));

    for system in SYSTEMS {
        assert_eq!(
            h.fakes.count(|call| matches!(
                call,
                Call::CreateAccount { system: s, username, password }
                    if s == system && *username == creds.username && *password == creds.password
            )),
            1
        );
    }
    let domain = format!("{name}.{DOMAIN}");
    let upserts = h
        .fakes
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            Call::UpsertDns { domain, vips } => Some((domain, vips)),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(upserts.len(), 1);
    assert_eq!(upserts[0].0, domain);
    assert_eq!(upserts[0].1.api, "192.168.100.12".parse::<std::net::IpAddr>().unwrap());
    assert_eq!(upserts[0].1.ingress, "192.168.100.13".parse::<std::net::IpAddr>().unwrap());

    let messages = h.fakes.messages_to("alice");
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("Your lease has been fulfilled"));
    assert!(messages[0].contains(&creds.password));
    assert!(messages[0].contains("192.168.100.12"));

    // the fulfillment notification arrives again
    let outcome = h.manager.reconciler.reconcile(&name).await.unwrap();
    assert_eq!(outcome, Reconciled::Live { queued: false });
    assert!(h.queued().is_empty());
    assert_eq!(h.worker.process(&name).await, Provisioned::Skipped);
    assert_eq!(h.fakes.messages_to("alice").len(), 1);
}

#[tokio::test]
async fn test_account_failure_is_not_retried() {
    let mut h = Harness::new();
    let name = fulfilled(&mut h, "bob").await;
    h.fakes.set_fail_accounts(true);

    assert_eq!(h.worker.process(&name).await, Provisioned::Abandoned);
    let messages = h.fakes.messages_to("bob");
    assert_eq!(messages.len(), 1);
    assert!(messages[0].starts_with("unable to create user:"));

    let lease = h.lease(&name).await;
    assert!(lease.has_credentials());
    assert!(!lease.details_sent());

    // later notifications leave it for a human
    h.fakes.set_fail_accounts(false);
    let outcome = h.manager.reconciler.reconcile(&name).await.unwrap();
    assert_eq!(outcome, Reconciled::Live { queued: false });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.queued().is_empty());
    assert_eq!(h.fakes.count(|call| matches!(call, Call::UpsertDns { .. })), 0);
}

#[tokio::test]
async fn test_dns_failure_is_reported_and_skipped() {
    let mut h = Harness::new();
    let name = fulfilled(&mut h, "carol").await;
    h.fakes.set_fail_dns(true);

    assert_eq!(h.worker.process(&name).await, Provisioned::Completed);
    let messages = h.fakes.messages_to("carol");
    assert_eq!(messages.len(), 2);
    assert!(messages[0].starts_with("unable to create DNS records. you'll need to create them yourself"));
    assert!(messages[1].contains("Your lease has been fulfilled"));
    assert!(h.lease(&name).await.details_sent());
}

#[tokio::test]
async fn test_requeued_lease_resumes() {
    let mut h = Harness::new();
    let name = fulfilled(&mut h, "dave").await;
    h.fakes.set_fail_messages(true);

    assert_eq!(h.worker.process(&name).await, Provisioned::Requeued);
    let issued = h.lease(&name).await.credentials().unwrap();
    assert!(h.manager.cache.is_queued(&name));

    h.fakes.set_fail_messages(false);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(h.queued(), vec![name.clone()]);
    assert_eq!(h.worker.process(&name).await, Provisioned::Completed);

    // the credentials from the first pass are kept
    let lease = h.lease(&name).await;
    assert_eq!(lease.credentials().unwrap(), issued);
    assert!(lease.details_sent());
    assert!(lease.meta.flag(keys::ACCOUNTS_CREATED));
    assert!(lease.meta.flag(keys::DNS_REQUESTED));
    assert_eq!(h.fakes.messages_to("dave").len(), 1);

    // accounts and records from the first pass aren't created again
    for system in SYSTEMS {
        assert_eq!(
            h.fakes.count(|call| matches!(
                call,
                Call::CreateAccount { system: s, .. } if s == system
            )),
            1
        );
    }
    assert_eq!(h.fakes.count(|call| matches!(call, Call::UpsertDns { .. })), 1);
}

#[tokio::test]
async fn test_requeued_lease_skips_dns() {
    let mut h = Harness::new();
    let name = fulfilled(&mut h, "heidi").await;
    h.fakes.set_fail_messages(true);
    assert_eq!(h.worker.process(&name).await, Provisioned::Requeued);
    assert!(h.lease(&name).await.meta.flag(keys::DNS_REQUESTED));

    // a dns server that broke since the first pass isn't asked again
    h.fakes.set_fail_messages(false);
    h.fakes.set_fail_dns(true);
    assert_eq!(h.worker.process(&name).await, Provisioned::Completed);

    let messages = h.fakes.messages_to("heidi");
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("Your lease has been fulfilled"));
    assert_eq!(h.fakes.count(|call| matches!(call, Call::UpsertDns { .. })), 1);
}

#[tokio::test]
async fn test_unbound_network_is_requeued() {
    let mut h = Harness::new();
    let lease = h.manager.service.acquire("erin", request(1)).await.unwrap();
    h.fulfill(lease.name(), None).await;
    h.manager.reconciler.reconcile(lease.name()).await.unwrap();
    let name = h.queued().remove(0);

    for _ in 0..3 {
        assert_eq!(h.worker.process(&name).await, Provisioned::Requeued);
    }
    assert!(!h.lease(&name).await.has_credentials());
    assert_eq!(h.fakes.count(|call| matches!(call, Call::CreateAccount { .. })), 0);
    assert_eq!(h.fakes.count(|call| matches!(call, Call::UpsertDns { .. })), 0);
    assert!(h.fakes.messages_to("erin").is_empty());
    assert!(h.manager.cache.is_queued(&name));

    // once the scheduler binds a network the lease goes through once
    h.seed_network("net-3", 8).await;
    h.fulfill(&name, Some("net-3")).await;
    assert_eq!(h.worker.process(&name).await, Provisioned::Completed);
    assert_eq!(
        h.fakes.count(|call| matches!(call, Call::CreateAccount { .. })),
        SYSTEMS.len()
    );
    assert_eq!(h.fakes.messages_to("erin").len(), 1);
}

#[tokio::test]
async fn test_deleted_lease_is_dropped() {
    let mut h = Harness::new();
    let name = fulfilled(&mut h, "frank").await;
    h.manager.service.release("frank").await.unwrap();

    assert_eq!(h.worker.process(&name).await, Provisioned::Dropped);
    assert!(!h.manager.cache.is_queued(&name));
    assert!(!h.lease(&name).await.has_credentials());
}

#[tokio::test]
async fn test_network_only_lease_gets_network_details() {
    let mut h = Harness::new();
    h.seed_network("net-2", 4).await;
    h.manager.service.acquire("grace", request(2)).await.unwrap();
    let companion = h
        .store
        .list::<resource_store::Lease>(
            common::NS,
            &resource_store::Selector::everything().eq(keys::NETWORK_ONLY, "true"),
        )
        .await
        .unwrap()
        .remove(0);
    h.fulfill(companion.name(), Some("net-2")).await;
    let outcome = h.manager.reconciler.reconcile(companion.name()).await.unwrap();
    assert_eq!(outcome, Reconciled::Live { queued: true });
    let name = h.queued().remove(0);

    assert_eq!(h.worker.process(&name).await, Provisioned::Completed);
    let lease = h.lease(&name).await;
    assert!(lease.meta.flag(keys::NETWORK_DETAILS_SENT));
    assert!(!lease.has_credentials());
    assert_eq!(h.fakes.count(|call| matches!(call, Call::CreateAccount { .. })), 0);

    let messages = h.fakes.messages_to("grace");
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("ci-vlan-net-2"));

    // marked, so it isn't queued again
    let outcome = h.manager.reconciler.reconcile(&name).await.unwrap();
    assert_eq!(outcome, Reconciled::Live { queued: false });
}
