//! # Provisioning worker
//!
//! A single consumer drains a bounded queue of lease names. For a compute
//! lease it waits for a bound network, then issues temporary credentials,
//! creates accounts on every backing system, upserts DNS records and sends
//! the owner the lease details. A network-only lease just gets the network
//! details. Each step is gated on annotations so a requeued lease resumes
//! where it stopped.
use std::{sync::Arc, time::Duration};

use provisioning::{AccountRequest, Credentials, details};
use resource_store::{Lease, ResourceStore};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn};
use tracing_futures::Instrument;

use crate::{
    LeaseError, LeaseResult,
    cache::LeaseCache,
    context::{Collaborators, Settings},
    keys::{self, LeaseExt},
    messages,
    metrics::{
        ACCOUNT_FAILURES, DNS_FAILURES, MESSAGE_FAILURES, PROVISION_ABANDONED,
        PROVISION_COMPLETED, PROVISION_QUEUE_DEPTH, PROVISION_REQUEUED,
    },
    reconcile::bound_network,
};

/// attempts at writing a "details sent" marker before giving up
const MARK_ATTEMPTS: usize = 3;

/// Sending half of the provisioning queue. `push` waits while the queue is full.
#[derive(Debug, Clone)]
pub struct ProvisionQueue {
    tx: mpsc::Sender<String>,
}

impl ProvisionQueue {
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub async fn push(&self, name: String) -> LeaseResult<()> {
        self.tx
            .send(name)
            .await
            .map_err(|_| LeaseError::QueueClosed)?;
        self.update_depth();
        Ok(())
    }

    /// push `name` once `delay` has passed, without waiting for it
    pub fn push_after(&self, name: String, delay: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = queue.push(name.clone()).await {
                warn!(lease = %name, ?err, "dropping requeued lease");
            }
        });
    }

    /// items waiting to be picked up
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    fn update_depth(&self) {
        PROVISION_QUEUE_DEPTH.set(self.depth() as i64);
    }
}

/// How far one pass over a queued lease got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    /// details already delivered
    Skipped,
    /// the lease is gone, being deleted, or not provisionable
    Dropped,
    /// will be tried again after the requeue delay
    Requeued,
    /// account creation failed, the owner was told to get help
    Abandoned,
    Completed,
}

#[derive(Debug)]
pub struct ProvisionWorker<S> {
    store: Arc<S>,
    cache: Arc<LeaseCache>,
    queue: ProvisionQueue,
    rx: mpsc::Receiver<String>,
    collaborators: Collaborators,
    settings: Arc<Settings>,
}

impl<S: ResourceStore> ProvisionWorker<S> {
    pub fn new(
        store: Arc<S>,
        cache: Arc<LeaseCache>,
        (queue, rx): (ProvisionQueue, mpsc::Receiver<String>),
        collaborators: Collaborators,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            store,
            cache,
            queue,
            rx,
            collaborators,
            settings,
        }
    }

    /// Process queued leases one at a time until `token` is cancelled or
    /// every sender is gone.
    pub async fn run(mut self, token: CancellationToken) {
        info!("provisioning worker started");
        loop {
            let name = tokio::select! {
                _ = token.cancelled() => break,
                name = self.rx.recv() => match name {
                    Some(name) => name,
                    None => break,
                },
            };
            self.queue.update_depth();
            let span = info_span!("provision", lease = %name);
            self.process(&name).instrument(span).await;
        }
        info!("provisioning worker stopped");
    }

    /// Take the next queued lease without waiting.
    pub fn try_next(&mut self) -> Option<String> {
        let name = self.rx.try_recv().ok()?;
        self.queue.update_depth();
        Some(name)
    }

    /// Run one lease through provisioning and requeue or release it.
    pub async fn process(&self, name: &str) -> Provisioned {
        let outcome = match self.provision(name).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(lease = %name, ?err, "provisioning step failed");
                Provisioned::Requeued
            }
        };
        debug!(lease = %name, ?outcome, "provisioning pass done");
        if outcome == Provisioned::Requeued {
            PROVISION_REQUEUED.inc();
            self.queue
                .push_after(name.to_owned(), self.settings.provisioning().requeue_delay);
        } else {
            self.cache.unmark_queued(name);
        }
        outcome
    }

    // store errors bubble up and requeue the lease
    async fn provision(&self, name: &str) -> LeaseResult<Provisioned> {
        let lease = match self
            .store
            .get::<Lease>(self.settings.namespace(), name)
            .await
        {
            Ok(lease) => lease,
            Err(err) if err.is_not_found() => return Ok(Provisioned::Dropped),
            Err(err) => return Err(err.into()),
        };
        if lease.meta.is_deleting() || !lease.is_fulfilled() {
            return Ok(Provisioned::Dropped);
        }
        if lease.details_sent() {
            return Ok(Provisioned::Skipped);
        }
        let Some(owner) = lease.owner().map(str::to_owned) else {
            warn!(lease = %name, "lease has no owner to provision for");
            return Ok(Provisioned::Dropped);
        };

        if lease.is_network_only() {
            self.provision_network_only(&lease, &owner).await
        } else {
            self.provision_compute(lease, &owner).await
        }
    }

    async fn provision_compute(&self, lease: Lease, owner: &str) -> LeaseResult<Provisioned> {
        let name = lease.name().to_owned();
        // no accounts or records are created until the scheduler has bound a network
        let Some(network) =
            bound_network(&*self.store, self.settings.namespace(), &lease).await?
        else {
            debug!(lease = %name, "no network bound yet");
            return Ok(Provisioned::Requeued);
        };

        let (mut lease, creds) = match lease.credentials() {
            Some(creds) => (lease, creds),
            None => self.issue_credentials(lease).await?,
        };
        let vips = match details::vips(&network) {
            Ok(vips) => vips,
            Err(err) => {
                PROVISION_ABANDONED.inc();
                error!(lease = %name, ?err, "network has no VIPs for this lease");
                self.notify(owner, &messages::dns_failure(&err)).await;
                return Ok(Provisioned::Abandoned);
            }
        };
        let provisioning = self.settings.provisioning();

        if !lease.meta.flag(keys::ACCOUNTS_CREATED) {
            for system in &provisioning.systems {
                let request = AccountRequest {
                    domain: &provisioning.account_domain,
                    admin: &provisioning.admin,
                    username: &creds.username,
                    password: &creds.password,
                    group: &provisioning.account_group,
                };
                if let Err(err) = self
                    .collaborators
                    .accounts
                    .create_account(system, request)
                    .await
                {
                    ACCOUNT_FAILURES.inc();
                    PROVISION_ABANDONED.inc();
                    error!(lease = %name, %system, ?err, "failed to create account, giving up");
                    self.notify(owner, &messages::account_failure(&err)).await;
                    return Ok(Provisioned::Abandoned);
                }
            }
            lease = self.complete_step(lease, keys::ACCOUNTS_CREATED).await?;
        }

        if !lease.meta.flag(keys::DNS_REQUESTED) {
            match self.settings.cluster_domain(&name) {
                Some(domain) => {
                    if let Err(err) = self.collaborators.dns.upsert_records(vips, &domain).await {
                        DNS_FAILURES.inc();
                        warn!(lease = %name, ?err, "failed to create dns records");
                        self.notify(owner, &messages::dns_failure(&err)).await;
                    }
                }
                None => debug!(lease = %name, "no domain configured, skipping dns"),
            }
            lease = self.complete_step(lease, keys::DNS_REQUESTED).await?;
        }

        let Some(expires_at) = self.settings.expires_at(&lease) else {
            warn!(lease = %name, "lease has no creation timestamp");
            return Ok(Provisioned::Requeued);
        };
        let install_config = match details::InstallConfig::new(
            &lease,
            &network,
            &creds,
            &provisioning.domain_name,
            &provisioning.account_domain,
        ) {
            Ok(install_config) => install_config,
            Err(err) => {
                PROVISION_ABANDONED.inc();
                error!(lease = %name, ?err, "unable to render lease details");
                return Ok(Provisioned::Abandoned);
            }
        };
        let content =
            details::lease_details(&lease, &install_config, expires_at, &provisioning.systems);
        if let Err(err) = self
            .collaborators
            .messenger
            .send_direct_message(owner, &content)
            .await
        {
            MESSAGE_FAILURES.inc();
            warn!(lease = %name, ?err, "failed to send lease details");
            return Ok(Provisioned::Requeued);
        }

        self.mark(&name, keys::DETAILS_SENT).await;
        PROVISION_COMPLETED.inc();
        info!(lease = %name, %owner, "lease details sent");
        Ok(Provisioned::Completed)
    }

    async fn provision_network_only(&self, lease: &Lease, owner: &str) -> LeaseResult<Provisioned> {
        let name = lease.name();
        let Some(network) =
            bound_network(&*self.store, self.settings.namespace(), lease).await?
        else {
            debug!(lease = %name, "no network bound yet");
            return Ok(Provisioned::Requeued);
        };
        if let Err(err) = self
            .collaborators
            .messenger
            .send_direct_message(owner, &details::network_details(&network))
            .await
        {
            MESSAGE_FAILURES.inc();
            warn!(lease = %name, ?err, "failed to send network details");
            return Ok(Provisioned::Requeued);
        }
        self.mark(name, keys::NETWORK_DETAILS_SENT).await;
        PROVISION_COMPLETED.inc();
        info!(lease = %name, %owner, "network details sent");
        Ok(Provisioned::Completed)
    }

    async fn issue_credentials(&self, mut lease: Lease) -> LeaseResult<(Lease, Credentials)> {
        let creds = Credentials::for_lease(lease.name());
        let annotations = &mut lease.meta.annotations;
        annotations.insert(keys::TEMP_USERNAME.to_owned(), creds.username.clone());
        annotations.insert(keys::TEMP_PASSWORD.to_owned(), creds.password.clone());
        let lease = self.store.update(lease).await?;
        debug!(lease = %lease.name(), "temporary credentials issued");
        Ok((lease, creds))
    }

    // store errors requeue the lease and the step runs again
    async fn complete_step(&self, mut lease: Lease, key: &str) -> LeaseResult<Lease> {
        lease
            .meta
            .annotations
            .insert(key.to_owned(), "true".to_owned());
        let lease = self.store.update(lease).await?;
        debug!(lease = %lease.name(), key, "provisioning step done");
        Ok(lease)
    }

    // a failed marker is logged only, requeueing would resend the details
    async fn mark(&self, name: &str, key: &str) {
        for attempt in 1..=MARK_ATTEMPTS {
            let mut lease = match self
                .store
                .get::<Lease>(self.settings.namespace(), name)
                .await
            {
                Ok(lease) => lease,
                Err(err) => {
                    warn!(lease = %name, key, ?err, "unable to fetch lease to mark");
                    return;
                }
            };
            lease.meta.labels.insert(key.to_owned(), "true".to_owned());
            match self.store.update(lease).await {
                Ok(_) => return,
                Err(err) if err.is_retryable() => {
                    debug!(lease = %name, key, attempt, ?err, "marking lease conflicted");
                }
                Err(err) => {
                    warn!(lease = %name, key, ?err, "unable to mark lease");
                    return;
                }
            }
        }
        warn!(lease = %name, key, "gave up marking lease");
    }

    async fn notify(&self, owner: &str, content: &str) {
        if let Err(err) = self
            .collaborators
            .messenger
            .send_direct_message(owner, content)
            .await
        {
            MESSAGE_FAILURES.inc();
            warn!(%owner, ?err, "failed to notify owner");
        }
    }
}
