//! # Pruning sweep
//!
//! Deletes owned leases past their expiration and reminds owners whose
//! lease is about to expire. The decision is made under the cache lock,
//! messages and deletions go out after it is released. Deleted leases are
//! cleaned up by the reconciler.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use resource_store::ResourceStore;
use tracing::{debug, error, info, warn};

use crate::{
    cache::LeaseCache,
    context::{Collaborators, Settings},
    keys::LeaseExt,
    messages,
    metrics::{EXPIRY_WARNINGS, LEASES_PRUNED, MESSAGE_FAILURES, PRUNE_ERRORS, PRUNE_SWEEPS},
};

/// Counts from one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PruneStats {
    pub warned: u64,
    pub pruned: u64,
    pub failed: u64,
}

#[derive(Debug)]
pub struct Pruner<S> {
    store: Arc<S>,
    cache: Arc<LeaseCache>,
    collaborators: Collaborators,
    settings: Arc<Settings>,
}

impl<S: ResourceStore> Pruner<S> {
    pub fn new(
        store: Arc<S>,
        cache: Arc<LeaseCache>,
        collaborators: Collaborators,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            store,
            cache,
            collaborators,
            settings,
        }
    }

    pub async fn sweep(&self) -> PruneStats {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> PruneStats {
        PRUNE_SWEEPS.inc();
        let mut stats = PruneStats::default();
        let plan = self.cache.prune_plan(now, &self.settings);

        for (lease, expires_at) in plan.warn {
            let Some(owner) = lease.owner() else {
                continue;
            };
            let content = messages::expiry_warning(expires_at, self.settings.max_renewals());
            match self
                .collaborators
                .messenger
                .send_direct_message(owner, &content)
                .await
            {
                Ok(()) => {
                    EXPIRY_WARNINGS.inc();
                    stats.warned += 1;
                    debug!(lease = %lease.name(), %owner, %expires_at, "expiry reminder sent");
                }
                Err(err) => {
                    // try again next sweep
                    MESSAGE_FAILURES.inc();
                    self.cache.clear_warning(lease.name());
                    warn!(lease = %lease.name(), %owner, ?err, "failed to send expiry reminder");
                }
            }
        }

        for lease in plan.expired {
            match self.store.delete(&lease).await {
                Ok(()) => {
                    LEASES_PRUNED.inc();
                    stats.pruned += 1;
                    info!(lease = %lease.name(), owner = ?lease.owner(), "pruned expired lease");
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    // picked up again next sweep
                    PRUNE_ERRORS.inc();
                    stats.failed += 1;
                    error!(lease = %lease.name(), ?err, "failed to delete expired lease");
                }
            }
        }
        stats
    }
}
