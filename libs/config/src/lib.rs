use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use leasekeeper_core::env::{parse_list, parse_var_opt};
use tracing::{debug, warn};

pub mod wire;

pub use wire::{Dns, Network, Pool, Reconcile, TsigKey};

/// env var overriding `provisioning.domain_name`
pub const USER_DOMAIN_NAME: &str = "USER_DOMAIN_NAME";
/// env var overriding `provisioning.systems`, space separated
pub const ACCOUNT_MINTING_SYSTEMS: &str = "ACCOUNT_MINTING_VCENTERS";
/// admin username for account minting, never read from the config file
pub const ADMIN_USERNAME: &str = "ADMIN_CREDENTIAL_MINTER_USERNAME";
/// admin password for account minting, never read from the config file
pub const ADMIN_PASSWORD: &str = "ADMIN_CREDENTIAL_MINTER_PASSWORD";

/// server config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseKeeperConfig {
    namespace: String,
    leases: LeasePolicy,
    provisioning: ProvisioningConfig,
    dns: Option<Dns>,
    reconcile: Reconcile,
    pools: Vec<Pool>,
    networks: Vec<Network>,
    path: Option<PathBuf>,
}

/// lease timing & request defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeasePolicy {
    /// time added to a lease per renewal, and the initial lease length
    pub time_increment: Duration,
    pub max_renewals: u32,
    /// how long before expiry the owner gets a reminder
    pub expiry_warning: Duration,
    pub prune_interval: Duration,
    pub default_vcpus: u32,
    pub default_memory: u32,
    pub default_networks: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningConfig {
    pub domain_name: String,
    pub account_domain: String,
    pub account_group: String,
    pub systems: Vec<String>,
    pub admin: AdminCredentials,
    pub requeue_delay: Duration,
    pub queue_capacity: usize,
    pub dns_ttl: u32,
}

/// credentials used to mint accounts on the backing systems
#[derive(Clone, PartialEq, Eq, Default)]
pub struct AdminCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for AdminCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl AdminCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// read from `ADMIN_CREDENTIAL_MINTER_USERNAME`/`ADMIN_CREDENTIAL_MINTER_PASSWORD`
    pub fn from_env() -> Self {
        Self {
            username: parse_var_opt(ADMIN_USERNAME).unwrap_or_default(),
            password: parse_var_opt(ADMIN_PASSWORD).unwrap_or_default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.username.is_empty() || self.password.is_empty()
    }
}

impl LeaseKeeperConfig {
    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path)
            .with_context(|| format!("failed to find config at {}", &path.display()))?;
        let mut config = Self::from_wire(decode(&input)?, AdminCredentials::from_env())?;
        config.apply_env();
        config.path = Some(path.to_path_buf());
        debug!(?config);
        Ok(config)
    }

    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work.
    /// Does not consult the environment.
    pub fn parse_str<S: AsRef<str>>(s: S) -> Result<Self> {
        let config = Self::from_wire(decode(s.as_ref())?, AdminCredentials::default())?;
        debug!(?config);
        Ok(config)
    }

    /// validate the wire format
    pub fn from_wire(cfg: wire::Config, admin: AdminCredentials) -> Result<Self> {
        if cfg.namespace.trim().is_empty() {
            bail!("namespace cannot be empty");
        }
        if cfg.provisioning.queue_capacity == 0 {
            bail!("provisioning.queue_capacity must be greater than 0");
        }
        if cfg.leases.expiry_warning >= cfg.leases.time_increment {
            bail!(
                "leases.expiry_warning ({:?}) must be shorter than leases.time_increment ({:?})",
                cfg.leases.expiry_warning,
                cfg.leases.time_increment
            );
        }
        if cfg.reconcile.base_delay > cfg.reconcile.max_delay {
            bail!("reconcile.base_delay cannot exceed reconcile.max_delay");
        }
        let mut pool_names = cfg.pools.iter().map(|p| &p.name).collect::<Vec<_>>();
        pool_names.sort();
        if pool_names.windows(2).any(|w| w[0] == w[1]) {
            bail!("pool names must be unique");
        }
        Ok(Self {
            namespace: cfg.namespace,
            leases: LeasePolicy {
                time_increment: cfg.leases.time_increment,
                max_renewals: cfg.leases.max_renewals,
                expiry_warning: cfg.leases.expiry_warning,
                prune_interval: cfg.leases.prune_interval,
                default_vcpus: cfg.leases.default_vcpus,
                default_memory: cfg.leases.default_memory,
                default_networks: cfg.leases.default_networks,
            },
            provisioning: ProvisioningConfig {
                domain_name: cfg.provisioning.domain_name,
                account_domain: cfg.provisioning.account_domain,
                account_group: cfg.provisioning.account_group,
                systems: cfg.provisioning.systems,
                admin,
                requeue_delay: cfg.provisioning.requeue_delay,
                queue_capacity: cfg.provisioning.queue_capacity,
                dns_ttl: cfg.provisioning.dns_ttl,
            },
            dns: cfg.dns,
            reconcile: cfg.reconcile,
            pools: cfg.pools,
            networks: cfg.networks,
            path: None,
        })
    }

    /// env vars win over the file for the domain name & account systems
    fn apply_env(&mut self) {
        if let Some(domain) = parse_var_opt::<String>(USER_DOMAIN_NAME) {
            self.provisioning.domain_name = domain;
        }
        if let Some(systems) = parse_list(ACCOUNT_MINTING_SYSTEMS) {
            self.provisioning.systems = systems;
        }
        if self.provisioning.domain_name.is_empty() {
            warn!("no user domain name configured, DNS records will not be created");
        }
        if !self.provisioning.systems.is_empty() && self.provisioning.admin.is_empty() {
            warn!(
                systems = ?self.provisioning.systems,
                "account systems configured without admin credentials"
            );
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
    pub fn leases(&self) -> &LeasePolicy {
        &self.leases
    }
    pub fn provisioning(&self) -> &ProvisioningConfig {
        &self.provisioning
    }
    pub fn dns(&self) -> Option<&Dns> {
        self.dns.as_ref()
    }
    pub fn reconcile(&self) -> &Reconcile {
        &self.reconcile
    }
    pub fn pools(&self) -> &[Pool] {
        &self.pools
    }
    pub fn networks(&self) -> &[Network] {
        &self.networks
    }
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl Default for LeaseKeeperConfig {
    fn default() -> Self {
        let leases = wire::Leases::default();
        let provisioning = wire::Provisioning::default();
        Self {
            namespace: wire::default_namespace(),
            leases: LeasePolicy {
                time_increment: leases.time_increment,
                max_renewals: leases.max_renewals,
                expiry_warning: leases.expiry_warning,
                prune_interval: leases.prune_interval,
                default_vcpus: leases.default_vcpus,
                default_memory: leases.default_memory,
                default_networks: leases.default_networks,
            },
            provisioning: ProvisioningConfig {
                domain_name: provisioning.domain_name,
                account_domain: provisioning.account_domain,
                account_group: provisioning.account_group,
                systems: provisioning.systems,
                admin: AdminCredentials::default(),
                requeue_delay: provisioning.requeue_delay,
                queue_capacity: provisioning.queue_capacity,
                dns_ttl: provisioning.dns_ttl,
            },
            dns: None,
            reconcile: Reconcile::default(),
            pools: Vec::new(),
            networks: Vec::new(),
            path: None,
        }
    }
}

fn decode(input: &str) -> Result<wire::Config> {
    match serde_json::from_str(input) {
        Ok(cfg) => Ok(cfg),
        Err(_err) => {
            debug!("failed parsing config from json, trying yaml");
            Ok(serde_yaml::from_str(input)?)
        }
    }
}
