use std::{net::SocketAddr, time::Duration};

use anyhow::{Context, Result};
use ipnet::IpNet;
use serde::{Deserialize, Deserializer, Serialize, de};

/// top-level config type
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub leases: Leases,
    #[serde(default)]
    pub provisioning: Provisioning,
    pub dns: Option<Dns>,
    #[serde(default)]
    pub reconcile: Reconcile,
    #[serde(default)]
    pub pools: Vec<Pool>,
    #[serde(default)]
    pub networks: Vec<Network>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Leases {
    #[serde(
        default = "default_time_increment",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub time_increment: Duration,
    #[serde(default = "default_max_renewals")]
    pub max_renewals: u32,
    #[serde(
        default = "default_expiry_warning",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub expiry_warning: Duration,
    #[serde(
        default = "default_prune_interval",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub prune_interval: Duration,
    #[serde(default = "default_vcpus")]
    pub default_vcpus: u32,
    #[serde(default = "default_memory")]
    pub default_memory: u32,
    #[serde(default = "default_networks")]
    pub default_networks: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Provisioning {
    /// user facing DNS domain, records are created under `<lease>.<domain_name>`
    #[serde(default)]
    pub domain_name: String,
    #[serde(default = "default_account_domain")]
    pub account_domain: String,
    #[serde(default = "default_account_group")]
    pub account_group: String,
    /// backing systems accounts get minted on
    #[serde(default)]
    pub systems: Vec<String>,
    #[serde(
        default = "default_requeue_delay",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub requeue_delay: Duration,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_dns_ttl")]
    pub dns_ttl: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Dns {
    pub server: SocketAddr,
    /// zone the records are updated in, ex. `example.com.`
    pub zone: String,
    #[serde(
        default = "default_dns_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub timeout: Duration,
    pub tsig: Option<TsigKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TsigKey {
    pub name: String,
    #[serde(default = "default_tsig_algorithm")]
    pub algorithm: String,
    /// base64 key data
    pub data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Reconcile {
    #[serde(
        default = "default_base_delay",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub base_delay: Duration,
    #[serde(
        default = "default_max_delay",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub max_delay: Duration,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// pool object loaded into the resource store at startup
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Pool {
    pub name: String,
    #[serde(default)]
    pub server: String,
    pub vcpus: u32,
    pub memory: u32,
    #[serde(default)]
    pub no_schedule: bool,
    #[serde(default)]
    pub datacenter: String,
    #[serde(default)]
    pub datastore: String,
    #[serde(default)]
    pub compute_cluster: String,
    #[serde(default)]
    pub resource_pool: String,
    #[serde(default)]
    pub networks: Vec<String>,
}

/// network object loaded into the resource store at startup
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Network {
    pub name: String,
    pub port_group_name: String,
    pub machine_network_cidr: IpNet,
    #[serde(default)]
    pub gateway: Option<std::net::IpAddr>,
    #[serde(default)]
    pub ip_addresses: Vec<std::net::IpAddr>,
    #[serde(default)]
    pub vlan_id: Option<u16>,
}

impl Default for Leases {
    fn default() -> Self {
        Self {
            time_increment: default_time_increment(),
            max_renewals: default_max_renewals(),
            expiry_warning: default_expiry_warning(),
            prune_interval: default_prune_interval(),
            default_vcpus: default_vcpus(),
            default_memory: default_memory(),
            default_networks: default_networks(),
        }
    }
}

impl Default for Provisioning {
    fn default() -> Self {
        Self {
            domain_name: String::new(),
            account_domain: default_account_domain(),
            account_group: default_account_group(),
            systems: Vec::new(),
            requeue_delay: default_requeue_delay(),
            queue_capacity: default_queue_capacity(),
            dns_ttl: default_dns_ttl(),
        }
    }
}

impl Default for Reconcile {
    fn default() -> Self {
        Self {
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            max_retries: default_max_retries(),
        }
    }
}

pub fn default_namespace() -> String {
    "vsphere-infra-helpers".to_owned()
}

pub const fn default_time_increment() -> Duration {
    Duration::from_secs(8 * 3600)
}

pub const fn default_max_renewals() -> u32 {
    3
}

pub const fn default_expiry_warning() -> Duration {
    Duration::from_secs(3600)
}

pub const fn default_prune_interval() -> Duration {
    Duration::from_secs(30 * 60)
}

pub const fn default_vcpus() -> u32 {
    24
}

pub const fn default_memory() -> u32 {
    96
}

pub const fn default_networks() -> u32 {
    1
}

pub fn default_account_domain() -> String {
    "ci.ibmc.devcluster.openshift.com".to_owned()
}

pub fn default_account_group() -> String {
    "CI".to_owned()
}

pub const fn default_requeue_delay() -> Duration {
    Duration::from_secs(2)
}

pub const fn default_queue_capacity() -> usize {
    64
}

pub const fn default_dns_ttl() -> u32 {
    300
}

pub const fn default_dns_timeout() -> Duration {
    Duration::from_secs(5)
}

pub fn default_tsig_algorithm() -> String {
    "hmac-sha256".to_owned()
}

pub const fn default_base_delay() -> Duration {
    Duration::from_millis(500)
}

pub const fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

pub const fn default_max_retries() -> u32 {
    5
}

/// Parse a duration string with optional time units
/// Accepts: "3600", "3600s", "60m", "24h", "250ms"
/// If no unit is specified, assumes seconds
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(anyhow::Error::msg("empty duration string"));
    }

    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    // split units
    let (num, unit) = s.split_at(end);
    let num = num.parse::<u64>().context("invalid number")?;

    let millis: u64 = match unit.trim() {
        "ms" => 1,
        "" | "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        other => anyhow::bail!(
            "unknown time unit '{}', only 'h', 'm', 's' or 'ms' are supported",
            other
        ),
    };

    num.checked_mul(millis)
        .map(Duration::from_millis)
        .context("duration value overflow")
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireDuration {
    Seconds(u64),
    String(String),
}

fn deserialize_duration<'de, D>(de: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let dur = match WireDuration::deserialize(de)? {
        WireDuration::Seconds(secs) => Duration::from_secs(secs),
        WireDuration::String(s) => parse_duration(&s).map_err(de::Error::custom)?,
    };
    if dur.is_zero() {
        return Err(de::Error::custom("duration cannot be zero"));
    }
    Ok(dur)
}

fn serialize_duration<S>(dur: &Duration, ser: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    if dur.subsec_millis() != 0 {
        ser.serialize_str(&format!("{}ms", dur.as_millis()))
    } else {
        ser.serialize_str(&format!("{}s", dur.as_secs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub static EXAMPLE: &str = include_str!("../../../../example.yaml");

    // test we can encode/decode example file
    #[test]
    fn test_example() {
        let cfg: crate::wire::Config = serde_yaml::from_str(EXAMPLE).unwrap();
        assert_eq!(cfg.namespace, "vsphere-infra-helpers");
        assert_eq!(cfg.pools.len(), 2);
        // back to the yaml
        let s = serde_yaml::to_string(&cfg).unwrap();
        let again: crate::wire::Config = serde_yaml::from_str(&s).unwrap();
        assert_eq!(cfg, again);
    }

    #[test]
    fn test_defaults() {
        let cfg: crate::wire::Config = serde_yaml::from_str("namespace: leases").unwrap();
        assert_eq!(cfg.namespace, "leases");
        assert_eq!(cfg.leases.time_increment, Duration::from_secs(8 * 3600));
        assert_eq!(cfg.leases.max_renewals, 3);
        assert_eq!(cfg.leases.prune_interval, Duration::from_secs(1800));
        assert_eq!(cfg.provisioning.requeue_delay, Duration::from_secs(2));
        assert_eq!(cfg.provisioning.account_group, "CI");
        assert!(cfg.dns.is_none());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("3600s").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("3600").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("90m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("8h").unwrap(), Duration::from_secs(28800));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration(" 2s ").unwrap(), Duration::from_secs(2));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("1d").is_err());
        assert!(parse_duration("h").is_err());
    }

    #[test]
    fn test_zero_duration_rejected() {
        let err = serde_yaml::from_str::<crate::wire::Config>("leases:\n  time_increment: 0s\n");
        assert!(err.is_err());
    }
}
