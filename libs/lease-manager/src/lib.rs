//! # lease-manager
//!
//! Grants, renews, expires and tears down user leases on shared vSphere
//! capacity, and drives provisioning once the scheduler fulfills a lease.
//!
//! - [`LeaseService`] answers Acquire/Renew/Release/Status and the pool operations
//! - [`LeaseReconciler`] and [`PoolReconciler`] keep the caches current from store notifications
//! - [`Pruner`] deletes expired leases and reminds owners before expiry
//! - [`ProvisionWorker`] issues credentials, accounts, DNS records and details messages
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]
use std::sync::Arc;

use resource_store::ResourceStore;

pub mod cache;
pub mod context;
pub mod error;
pub mod keys;
pub mod messages;
pub mod metrics;
pub mod pools;
pub mod provisioner;
pub mod pruner;
pub mod reconcile;
pub mod service;

pub use crate::{
    cache::LeaseCache,
    context::{Collaborators, Settings},
    error::{LeaseError, LeaseResult},
    keys::LeaseExt,
    pools::{PoolCache, PoolReconciler, PoolReport},
    provisioner::{ProvisionQueue, ProvisionWorker, Provisioned},
    pruner::{PruneStats, Pruner},
    reconcile::{LeaseReconciler, Reconciled, Reconciler, RetryPolicy, watch},
    service::{AcquireRequest, LeaseReport, LeaseService},
};

/// Every lease-manager component, wired to one store and one cache.
#[derive(Debug)]
pub struct LeaseManager<S> {
    pub store: Arc<S>,
    pub cache: Arc<LeaseCache>,
    pub pools: Arc<PoolCache>,
    pub settings: Arc<Settings>,
    pub service: Arc<LeaseService<S>>,
    pub reconciler: Arc<LeaseReconciler<S>>,
    pub pool_reconciler: Arc<PoolReconciler<S>>,
    pub pruner: Arc<Pruner<S>>,
}

impl<S: ResourceStore> LeaseManager<S> {
    /// Build the components. The provisioning worker is returned separately
    /// since it owns the receiving end of the queue and runs on its own task.
    pub fn new(
        store: Arc<S>,
        collaborators: Collaborators,
        settings: Settings,
    ) -> (Self, ProvisionWorker<S>) {
        let settings = Arc::new(settings);
        let cache = Arc::new(LeaseCache::new());
        let pools = Arc::new(PoolCache::new());
        let (queue, rx) = ProvisionQueue::bounded(settings.provisioning().queue_capacity);

        let worker = ProvisionWorker::new(
            store.clone(),
            cache.clone(),
            (queue.clone(), rx),
            collaborators.clone(),
            settings.clone(),
        );
        let manager = Self {
            service: Arc::new(LeaseService::new(
                store.clone(),
                cache.clone(),
                pools.clone(),
                settings.clone(),
            )),
            reconciler: Arc::new(LeaseReconciler::new(
                store.clone(),
                cache.clone(),
                queue,
                collaborators.clone(),
                settings.clone(),
            )),
            pool_reconciler: Arc::new(PoolReconciler::new(
                store.clone(),
                pools.clone(),
                settings.namespace(),
            )),
            pruner: Arc::new(Pruner::new(
                store.clone(),
                cache.clone(),
                collaborators,
                settings.clone(),
            )),
            store,
            cache,
            pools,
            settings,
        };
        (manager, worker)
    }
}
