//! # Reconciliation
//!
//! Reacts to change notifications from the resource store. Every handler
//! re-reads the object and is safe to run any number of times for the same
//! state. Notifications for one lease are handled one at a time; a
//! notification arriving while its lease is being reconciled schedules one
//! more pass once the current one finishes.
use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use config::Reconcile;
use futures::StreamExt;
use parking_lot::Mutex;
use provisioning::details;
use resource_store::{Kind, Lease, Network, ResourceStore, Selector, StoreError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn};
use tracing_futures::Instrument;

use crate::{
    LeaseResult,
    cache::LeaseCache,
    context::{Collaborators, Settings},
    keys::LeaseExt,
    messages,
    metrics::{
        ACCOUNT_FAILURES, DNS_FAILURES, LEASE_RECONCILE_ERRORS, LEASE_RECONCILES,
        LEASES_FINALIZED, MESSAGE_FAILURES, RESYNCS,
    },
    provisioner::ProvisionQueue,
};

/// Something that keeps local state in line with one resource kind.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    const KIND: Kind;

    /// handle a notification about `name`, without blocking the watch
    fn schedule(self: &Arc<Self>, name: String);

    /// relist every object of `KIND`, returns the names that need a pass
    async fn resync(&self) -> LeaseResult<Vec<String>>;
}

/// Feed notifications for `R::KIND` in `namespace` to `reconciler` until
/// `token` is cancelled. Subscribes before the initial resync so nothing
/// written in between is missed.
pub async fn watch<S, R>(
    store: Arc<S>,
    reconciler: Arc<R>,
    namespace: String,
    token: CancellationToken,
) where
    S: ResourceStore,
    R: Reconciler,
{
    let mut events = store.subscribe(R::KIND);
    resync_logged(&reconciler).await;
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!(kind = %R::KIND, "watch cancelled");
                return;
            }
            event = events.next() => match event {
                Some(Ok(notification)) => {
                    let meta = notification.object.meta();
                    if meta.namespace == namespace {
                        trace!(key = %notification.key(), change = ?notification.change, "notification");
                        reconciler.schedule(meta.name.clone());
                    }
                }
                Some(Err(StoreError::Lagged(missed))) => {
                    warn!(kind = %R::KIND, missed, "subscription lagged, resyncing");
                    resync_logged(&reconciler).await;
                }
                Some(Err(err)) => {
                    error!(kind = %R::KIND, ?err, "subscription error");
                }
                None => {
                    warn!(kind = %R::KIND, "subscription closed");
                    return;
                }
            }
        }
    }
}

async fn resync_logged<R: Reconciler>(reconciler: &Arc<R>) {
    RESYNCS.inc();
    match reconciler.resync().await {
        Ok(names) => {
            info!(kind = %R::KIND, count = names.len(), "resynced");
            for name in names {
                reconciler.schedule(name);
            }
        }
        // notifications will fill the cache in as objects change
        Err(err) => error!(kind = %R::KIND, ?err, "resync failed"),
    }
}

/// Exponential backoff for reconciliation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl From<Reconcile> for RetryPolicy {
    fn from(cfg: Reconcile) -> Self {
        Self {
            base_delay: cfg.base_delay,
            max_delay: cfg.max_delay,
            max_retries: cfg.max_retries,
        }
    }
}

impl RetryPolicy {
    /// delay before retry number `attempt` (0 based)
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }
}

/// What a single reconciliation pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// the lease no longer exists
    Gone,
    /// live lease cached, `queued` if it was handed to provisioning by this pass
    Live { queued: bool },
    /// being deleted without our finalizer, nothing to clean up
    Deleting,
    /// cleanup ran and the finalizer was dropped
    Finalized,
}

/// Keeps the lease cache current, owns the finalizer, cleans up deleted
/// leases and hands fulfilled ones to provisioning.
#[derive(Debug)]
pub struct LeaseReconciler<S> {
    store: Arc<S>,
    cache: Arc<LeaseCache>,
    queue: ProvisionQueue,
    collaborators: Collaborators,
    settings: Arc<Settings>,
    retry: RetryPolicy,
    /// lease name -> another pass requested while one was running
    inflight: Mutex<HashMap<String, bool>>,
}

impl<S: ResourceStore> LeaseReconciler<S> {
    pub fn new(
        store: Arc<S>,
        cache: Arc<LeaseCache>,
        queue: ProvisionQueue,
        collaborators: Collaborators,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            retry: RetryPolicy::from(*settings.reconcile()),
            store,
            cache,
            queue,
            collaborators,
            settings,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// One pass over the current state of lease `name`.
    pub async fn reconcile(&self, name: &str) -> LeaseResult<Reconciled> {
        LEASE_RECONCILES.inc();
        let lease = match self
            .store
            .get::<Lease>(self.settings.namespace(), name)
            .await
        {
            Ok(lease) => lease,
            Err(err) if err.is_not_found() => {
                self.cache.remove(name);
                return Ok(Reconciled::Gone);
            }
            Err(err) => return Err(err.into()),
        };
        if lease.meta.is_deleting() {
            self.finalize(lease).await
        } else {
            self.observe(lease).await
        }
    }

    async fn observe(&self, mut lease: Lease) -> LeaseResult<Reconciled> {
        if lease.owner().is_some() && !lease.meta.finalizer {
            lease.meta.finalizer = true;
            lease = self.store.update(lease).await?;
            debug!(lease = %lease.name(), "added finalizer");
        }
        self.cache.upsert(&lease);

        let name = lease.name();
        if !lease.needs_provisioning() || !self.cache.mark_queued(name) {
            return Ok(Reconciled::Live { queued: false });
        }
        if let Err(err) = self.queue.push(name.to_owned()).await {
            self.cache.unmark_queued(name);
            return Err(err);
        }
        info!(lease = %name, owner = ?lease.owner(), "queued for provisioning");
        Ok(Reconciled::Live { queued: true })
    }

    /// Cleanup and the deletion notice only run for compute leases, so a
    /// release with a network-only companion tells the owner once.
    async fn finalize(&self, lease: Lease) -> LeaseResult<Reconciled> {
        let name = lease.name().to_owned();
        self.cache.remove(&name);
        if !lease.meta.finalizer {
            return Ok(Reconciled::Deleting);
        }

        if !lease.is_network_only() {
            self.cleanup(&lease).await?;
            if let Some(owner) = lease.owner() {
                if let Err(err) = self
                    .collaborators
                    .messenger
                    .send_direct_message(owner, messages::RESOURCES_DELETED)
                    .await
                {
                    MESSAGE_FAILURES.inc();
                    warn!(lease = %name, ?err, "failed to notify owner of deletion");
                }
            }
        }

        // cleanup may have taken a while, drop the finalizer on the latest copy
        let mut latest = match self
            .store
            .get::<Lease>(self.settings.namespace(), &name)
            .await
        {
            Ok(latest) => latest,
            Err(err) if err.is_not_found() => return Ok(Reconciled::Gone),
            Err(err) => return Err(err.into()),
        };
        if latest.meta.finalizer {
            latest.meta.finalizer = false;
            match self.store.update(latest).await {
                Ok(_) => {}
                Err(err) if err.is_not_found() => return Ok(Reconciled::Gone),
                Err(err) => return Err(err.into()),
            }
        }
        LEASES_FINALIZED.inc();
        info!(lease = %name, "lease finalized");
        Ok(Reconciled::Finalized)
    }

    // provisioning failures are logged, store failures returned
    async fn cleanup(&self, lease: &Lease) -> LeaseResult<()> {
        let name = lease.name();
        match bound_network(&*self.store, self.settings.namespace(), lease).await? {
            Some(network) => match (details::vips(&network), self.settings.cluster_domain(name)) {
                (Ok(vips), Some(domain)) => {
                    if let Err(err) = self.collaborators.dns.delete_records(vips, &domain).await {
                        DNS_FAILURES.inc();
                        error!(lease = %name, ?err, "failed to delete dns records");
                    }
                }
                (Err(err), _) => warn!(lease = %name, ?err, "skipping dns cleanup"),
                (Ok(_), None) => debug!(lease = %name, "no domain configured, skipping dns cleanup"),
            },
            None => debug!(lease = %name, "no network bound, skipping dns cleanup"),
        }

        if let Some(creds) = lease.credentials() {
            let provisioning = self.settings.provisioning();
            for system in &provisioning.systems {
                if let Err(err) = self
                    .collaborators
                    .accounts
                    .delete_account(system, &creds.username, &provisioning.admin)
                    .await
                {
                    ACCOUNT_FAILURES.inc();
                    error!(lease = %name, %system, ?err, "failed to delete account");
                }
            }
        }
        Ok(())
    }

    async fn reconcile_with_retry(&self, name: &str) {
        let mut attempt = 0;
        loop {
            match self.reconcile(name).await {
                Ok(outcome) => {
                    trace!(lease = %name, ?outcome, "reconciled");
                    return;
                }
                Err(err) if err.is_retryable() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay(attempt);
                    debug!(lease = %name, ?err, attempt, ?delay, "reconcile failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    // the next notification for this lease tries again
                    LEASE_RECONCILE_ERRORS.inc();
                    error!(lease = %name, ?err, attempt, "reconcile failed");
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl<S: ResourceStore> Reconciler for LeaseReconciler<S> {
    const KIND: Kind = Kind::Lease;

    fn schedule(self: &Arc<Self>, name: String) {
        {
            let mut inflight = self.inflight.lock();
            if let Some(again) = inflight.get_mut(&name) {
                *again = true;
                return;
            }
            inflight.insert(name.clone(), false);
        }
        let this = Arc::clone(self);
        let span = info_span!("reconcile", lease = %name);
        tokio::spawn(
            async move {
                loop {
                    this.reconcile_with_retry(&name).await;
                    let again = {
                        let mut inflight = this.inflight.lock();
                        match inflight.get_mut(&name) {
                            Some(again) if *again => {
                                *again = false;
                                true
                            }
                            _ => {
                                inflight.remove(&name);
                                false
                            }
                        }
                    };
                    if !again {
                        break;
                    }
                }
            }
            .instrument(span),
        );
    }

    async fn resync(&self) -> LeaseResult<Vec<String>> {
        let leases = self
            .store
            .list::<Lease>(self.settings.namespace(), &Selector::everything())
            .await?;
        self.cache.replace(&leases);
        // finalizers, deletions and provisioning may have been missed
        Ok(leases.iter().map(|l| l.name().to_owned()).collect())
    }
}

/// The `Network` bound to `lease`, `None` if it has none or it is gone.
pub(crate) async fn bound_network<S: ResourceStore>(
    store: &S,
    namespace: &str,
    lease: &Lease,
) -> LeaseResult<Option<Network>> {
    let Some(network) = lease.network_name() else {
        return Ok(None);
    };
    match store.get::<Network>(namespace, network).await {
        Ok(network) => Ok(Some(network)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err.into()),
    }
}
