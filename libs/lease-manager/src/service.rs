//! # Lifecycle service
//!
//! Acquire, Renew, Release and Status for users, plus the pool operations.
//! Every store write happens outside the cache lock.
use std::{fmt, sync::Arc};

use chrono::{DateTime, SecondsFormat, Utc};
use config::LeasePolicy;
use resource_store::{
    Lease, LeaseSpec, ObjectMeta, Phase, Pool, ResourceStore, Selector,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::{
    LeaseError, LeaseResult,
    cache::LeaseCache,
    context::Settings,
    keys::{self, LeaseExt},
    metrics::{self, Op},
    pools::{PoolCache, PoolReport},
};

/// Resources asked for by Acquire.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AcquireRequest {
    pub vcpus: u32,
    /// GB
    pub memory: u32,
    /// empty or absent means any pool
    #[serde(default)]
    pub pool: Option<String>,
    /// more than one adds a network-only lease
    pub networks: u32,
}

impl AcquireRequest {
    pub fn from_policy(policy: &LeasePolicy) -> Self {
        Self {
            vcpus: policy.default_vcpus,
            memory: policy.default_memory,
            pool: None,
            networks: policy.default_networks,
        }
    }
}

/// What Status reports about a user's lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaseReport {
    pub name: String,
    pub vcpus: u32,
    pub memory: u32,
    pub phase: Phase,
    pub renewals: u32,
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Display for LeaseReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let expires = self
            .expires_at
            .map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_else(|| "unknown".to_owned());
        let width = self.name.len().max("Lease".len());
        writeln!(
            f,
            "{:<width$}  {:>5}  {:>8}  {:<20}",
            "Lease", "CPUs", "Mem (GB)", "Expires"
        )?;
        writeln!(
            f,
            "{:<width$}  {:>5}  {:>8}  {:<20}",
            self.name, self.vcpus, self.memory, expires
        )
    }
}

#[derive(Debug)]
pub struct LeaseService<S> {
    store: Arc<S>,
    cache: Arc<LeaseCache>,
    pools: Arc<PoolCache>,
    settings: Arc<Settings>,
}

impl<S: ResourceStore> LeaseService<S> {
    pub fn new(
        store: Arc<S>,
        cache: Arc<LeaseCache>,
        pools: Arc<PoolCache>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            store,
            cache,
            pools,
            settings,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// request filled in with the configured defaults
    pub fn default_request(&self) -> AcquireRequest {
        AcquireRequest::from_policy(self.settings.policy())
    }

    /// Create a lease for `user`. With more than one network requested a
    /// network-only lease is created first. Fails with `AlreadyLeased` if
    /// the user has a lease or another Acquire for them is running.
    #[instrument(level = "debug", skip_all, fields(user = %user))]
    pub async fn acquire(&self, user: &str, request: AcquireRequest) -> LeaseResult<Lease> {
        let res = self.try_acquire(user, request).await;
        metrics::observe(Op::Acquire, &res);
        res
    }

    async fn try_acquire(&self, user: &str, request: AcquireRequest) -> LeaseResult<Lease> {
        let reservation = self.cache.begin_acquire(user)?;

        let pool = request.pool.filter(|pool| !pool.is_empty());
        if let Some(pool) = &pool {
            let names = self.pool_names().await?;
            if !names.contains(pool) {
                return Err(LeaseError::PoolNotFound(pool.clone()));
            }
        }

        let companion = if request.networks > 1 {
            let spec = LeaseSpec {
                vcpus: 0,
                memory: 0,
                networks: 1,
                required_pool: pool.clone(),
            };
            let companion = self.store.create(self.new_lease(user, spec, true)).await?;
            debug!(lease = %companion.name(), %user, "created network-only lease");
            Some(companion)
        } else {
            None
        };

        let spec = LeaseSpec {
            vcpus: request.vcpus,
            memory: request.memory,
            networks: 1,
            required_pool: pool,
        };
        let lease = match self.store.create(self.new_lease(user, spec, false)).await {
            Ok(lease) => lease,
            Err(err) => {
                if let Some(companion) = companion {
                    if let Err(err) = self.store.delete(&companion).await {
                        warn!(lease = %companion.name(), ?err, "failed to remove network-only lease");
                    }
                }
                return Err(err.into());
            }
        };
        reservation.commit(&lease);
        info!(
            lease = %lease.name(),
            %user,
            vcpus = lease.spec.vcpus,
            memory = lease.spec.memory,
            "lease acquired"
        );
        Ok(lease)
    }

    fn new_lease(&self, user: &str, spec: LeaseSpec, network_only: bool) -> Lease {
        let mut meta = ObjectMeta::generated(self.settings.namespace(), keys::GENERATE_NAME);
        meta.labels.insert(keys::OWNER.to_owned(), user.to_owned());
        meta.annotations.insert(keys::OWNER.to_owned(), user.to_owned());
        if network_only {
            meta.labels
                .insert(keys::NETWORK_ONLY.to_owned(), "true".to_owned());
        }
        // cleanup must run before an owned lease can disappear
        meta.finalizer = true;
        Lease::new(meta, spec)
    }

    /// Extend `user`'s lease by one time increment. Returns the new expiration.
    #[instrument(level = "debug", skip_all, fields(user = %user))]
    pub async fn renew(&self, user: &str) -> LeaseResult<DateTime<Utc>> {
        let res = self.try_renew(user).await;
        metrics::observe(Op::Renew, &res);
        res
    }

    async fn try_renew(&self, user: &str) -> LeaseResult<DateTime<Utc>> {
        let cached = self.cache.active_lease(user).ok_or(LeaseError::NoLease)?;
        // the cache may be stale, renew what the store has
        let mut lease = match self
            .store
            .get::<Lease>(self.settings.namespace(), cached.name())
            .await
        {
            Ok(lease) if !lease.meta.is_deleting() => lease,
            Ok(_) => return Err(LeaseError::NoLease),
            Err(err) if err.is_not_found() => return Err(LeaseError::NoLease),
            Err(err) => return Err(err.into()),
        };

        let renewals = lease.renew_count() + 1;
        if renewals > self.settings.max_renewals() {
            let expires_at = self.expiration(&lease)?;
            return Err(LeaseError::RenewalLimitExceeded { expires_at });
        }
        lease
            .meta
            .labels
            .insert(keys::RENEW_COUNT.to_owned(), renewals.to_string());
        let lease = self.store.update(lease).await?;
        self.cache.upsert(&lease);

        let expires_at = self.expiration(&lease)?;
        info!(lease = %lease.name(), %user, renewals, %expires_at, "lease renewed");
        Ok(expires_at)
    }

    fn expiration(&self, lease: &Lease) -> LeaseResult<DateTime<Utc>> {
        self.settings.expires_at(lease).ok_or_else(|| {
            resource_store::StoreError::Invalid(format!(
                "lease {} has no creation timestamp",
                lease.name()
            ))
            .into()
        })
    }

    /// Delete every lease `user` owns. Deletion completes asynchronously once
    /// the reconciler has cleaned up, the user can acquire again right away.
    #[instrument(level = "debug", skip_all, fields(user = %user))]
    pub async fn release(&self, user: &str) -> LeaseResult<()> {
        let res = self.try_release(user).await;
        metrics::observe(Op::Release, &res);
        res
    }

    async fn try_release(&self, user: &str) -> LeaseResult<()> {
        if !self.cache.has_active_lease(user) {
            return Err(LeaseError::NoLease);
        }
        let selector = Selector::everything().eq(keys::OWNER, user);
        let leases = self
            .store
            .list::<Lease>(self.settings.namespace(), &selector)
            .await?;
        for lease in &leases {
            match self.store.delete(lease).await {
                Ok(()) => debug!(lease = %lease.name(), %user, "lease deletion requested"),
                Err(err) if err.is_not_found() => {}
                // the user stays cached so release can be retried
                Err(err) => return Err(err.into()),
            }
        }
        self.cache.clear_user(user, &leases);
        info!(%user, count = leases.len(), "leases released");
        Ok(())
    }

    /// Report on `user`'s lease from the cache.
    pub fn status(&self, user: &str) -> LeaseResult<LeaseReport> {
        let res = self
            .cache
            .active_lease(user)
            .map(|lease| LeaseReport {
                name: lease.name().to_owned(),
                vcpus: lease.spec.vcpus,
                memory: lease.spec.memory,
                phase: lease.status.phase,
                renewals: lease.renew_count(),
                expires_at: self.settings.expires_at(&lease),
            })
            .ok_or(LeaseError::NoLease);
        metrics::observe(Op::Status, &res);
        res
    }

    /// every cached lease
    pub fn leases(&self) -> Vec<Lease> {
        self.cache.leases()
    }

    /// Names of the pools in the store, read live.
    pub async fn pool_names(&self) -> LeaseResult<Vec<String>> {
        let pools = self
            .store
            .list::<Pool>(self.settings.namespace(), &Selector::everything())
            .await?;
        Ok(pools
            .into_iter()
            .filter(|pool| !pool.meta.is_deleting())
            .map(|pool| pool.meta.name)
            .collect())
    }

    /// Cordon or uncordon a pool.
    pub async fn set_pool_schedulable(&self, name: &str, schedulable: bool) -> LeaseResult<Pool> {
        let mut pool = match self
            .store
            .get::<Pool>(self.settings.namespace(), name)
            .await
        {
            Ok(pool) => pool,
            Err(err) if err.is_not_found() => return Err(LeaseError::PoolNotFound(name.to_owned())),
            Err(err) => return Err(err.into()),
        };
        if pool.spec.no_schedule == !schedulable {
            return Ok(pool);
        }
        pool.spec.no_schedule = !schedulable;
        let pool = self.store.update(pool).await?;
        self.pools.upsert(&pool);
        info!(pool = %name, schedulable, "pool schedulability changed");
        Ok(pool)
    }

    pub fn pool_status(&self) -> PoolReport {
        self.pools.report()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_report_display() {
        let report = LeaseReport {
            name: "user-lease-abcde".into(),
            vcpus: 4,
            memory: 16,
            phase: Phase::Fulfilled,
            renewals: 1,
            expires_at: Some(Utc.with_ymd_and_hms(2024, 1, 1, 16, 0, 0).unwrap()),
        };
        let text = report.to_string();
        let lines = text.lines().collect::<Vec<_>>();
        assert!(lines[0].starts_with("Lease"));
        assert!(lines[1].starts_with("user-lease-abcde"));
        assert!(lines[1].contains("2024-01-01T16:00:00Z"));
    }

    #[test]
    fn test_request_defaults() {
        let request: AcquireRequest =
            serde_json::from_str(r#"{"vcpus": 4, "memory": 16, "networks": 2}"#).unwrap();
        assert_eq!(request.pool, None);
        let defaults = AcquireRequest::from_policy(config::LeaseKeeperConfig::default().leases());
        assert_eq!(defaults.vcpus, 24);
        assert_eq!(defaults.memory, 96);
        assert_eq!(defaults.networks, 1);
    }
}
