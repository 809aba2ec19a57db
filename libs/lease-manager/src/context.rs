//! State shared by the lifecycle service and the background tasks.
use std::{fmt, sync::Arc};

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use config::{LeaseKeeperConfig, LeasePolicy, ProvisioningConfig, Reconcile};
use provisioning::{
    AccountManager, DnsRecords, Messenger,
    dry_run::{DryRunAccounts, DryRunDns, TracingMessenger},
};
use resource_store::Lease;

use crate::keys::LeaseExt;

/// Lease policy with the durations already converted for timestamp math.
#[derive(Debug, Clone)]
pub struct Settings {
    namespace: String,
    policy: LeasePolicy,
    provisioning: ProvisioningConfig,
    reconcile: Reconcile,
    increment: TimeDelta,
    warning: TimeDelta,
}

impl Settings {
    pub fn new(cfg: &LeaseKeeperConfig) -> Result<Self> {
        Self::from_parts(
            cfg.namespace(),
            *cfg.leases(),
            cfg.provisioning().clone(),
            *cfg.reconcile(),
        )
    }

    pub fn from_parts(
        namespace: impl Into<String>,
        policy: LeasePolicy,
        provisioning: ProvisioningConfig,
        reconcile: Reconcile,
    ) -> Result<Self> {
        Ok(Self {
            namespace: namespace.into(),
            increment: TimeDelta::from_std(policy.time_increment)
                .context("leases.time_increment out of range")?,
            warning: TimeDelta::from_std(policy.expiry_warning)
                .context("leases.expiry_warning out of range")?,
            policy,
            provisioning,
            reconcile,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn policy(&self) -> &LeasePolicy {
        &self.policy
    }

    pub fn provisioning(&self) -> &ProvisioningConfig {
        &self.provisioning
    }

    pub fn reconcile(&self) -> &Reconcile {
        &self.reconcile
    }

    pub fn max_renewals(&self) -> u32 {
        self.policy.max_renewals
    }

    /// creation + increment * (renewals + 1). `None` until the store has
    /// stamped a creation time.
    pub fn expires_at(&self, lease: &Lease) -> Option<DateTime<Utc>> {
        self.expires_after(lease, lease.renew_count())
    }

    pub fn expires_after(&self, lease: &Lease, renewals: u32) -> Option<DateTime<Utc>> {
        let periods = i32::try_from(renewals).ok()?.checked_add(1)?;
        lease
            .meta
            .creation_timestamp?
            .checked_add_signed(self.increment.checked_mul(periods)?)
    }

    /// start of the window in which the owner is reminded to renew
    pub fn warn_at(&self, expires_at: DateTime<Utc>) -> DateTime<Utc> {
        expires_at - self.warning
    }

    /// `<lease>.<domain>`, the cluster domain DNS records hang off of
    pub fn cluster_domain(&self, lease_name: &str) -> Option<String> {
        let domain = self.provisioning.domain_name.trim_matches('.');
        (!domain.is_empty()).then(|| format!("{lease_name}.{domain}"))
    }
}

/// The external services provisioning talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub accounts: Arc<dyn AccountManager>,
    pub dns: Arc<dyn DnsRecords>,
    pub messenger: Arc<dyn Messenger>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("accounts", &self.accounts)
            .field("dns", &self.dns)
            .field("messenger", &self.messenger)
            .finish()
    }
}

impl Collaborators {
    pub fn new(
        accounts: Arc<dyn AccountManager>,
        dns: Arc<dyn DnsRecords>,
        messenger: Arc<dyn Messenger>,
    ) -> Self {
        Self {
            accounts,
            dns,
            messenger,
        }
    }

    /// everything only logs
    pub fn dry_run() -> Self {
        Self::new(
            Arc::new(DryRunAccounts),
            Arc::new(DryRunDns),
            Arc::new(TracingMessenger),
        )
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use resource_store::{LeaseSpec, ObjectMeta};

    use super::*;
    use crate::keys;

    #[test]
    fn test_expiration() {
        let settings = Settings::new(&LeaseKeeperConfig::default()).unwrap();
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut meta = ObjectMeta::new("ns", "user-lease-abcde");
        meta.creation_timestamp = Some(created);
        let mut lease = Lease::new(meta, LeaseSpec::default());

        assert_eq!(
            settings.expires_at(&lease),
            Some(created + TimeDelta::hours(8))
        );
        lease.meta.labels.insert(keys::RENEW_COUNT.into(), "3".into());
        assert_eq!(
            settings.expires_at(&lease),
            Some(created + TimeDelta::hours(32))
        );
        assert_eq!(
            settings.warn_at(created + TimeDelta::hours(8)),
            created + TimeDelta::hours(7)
        );

        lease.meta.creation_timestamp = None;
        assert!(settings.expires_at(&lease).is_none());
    }

    #[test]
    fn test_cluster_domain() {
        let mut provisioning = LeaseKeeperConfig::default().provisioning().clone();
        let policy = *LeaseKeeperConfig::default().leases();
        let reconcile = *LeaseKeeperConfig::default().reconcile();
        provisioning.domain_name = String::new();
        let settings =
            Settings::from_parts("ns", policy, provisioning.clone(), reconcile).unwrap();
        assert!(settings.cluster_domain("user-lease-abcde").is_none());

        provisioning.domain_name = "ci.example.com.".into();
        let settings = Settings::from_parts("ns", policy, provisioning, reconcile).unwrap();
        assert_eq!(
            settings.cluster_domain("user-lease-abcde").as_deref(),
            Some("user-lease-abcde.ci.example.com")
        );
    }
}
