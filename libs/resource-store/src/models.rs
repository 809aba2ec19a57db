//! Resource kinds kept in the store.
//!
//! Every object is an [`ObjectMeta`] plus a kind specific spec/status. Labels
//! and annotations are plain string maps; the lease manager uses them as
//! boolean flags and to carry temporary secrets.

use std::{
    collections::BTreeMap,
    fmt,
    net::IpAddr,
};

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// label/annotation map
pub type Labels = BTreeMap<String, String>;

/// The kinds of resources the store holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Kind {
    Lease,
    Pool,
    Network,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Kind::Lease => "Lease",
                Kind::Pool => "Pool",
                Kind::Network => "Network",
            }
        )
    }
}

/// Identity of an object in the store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub kind: Kind,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: Kind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Reference from an object to the object that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub kind: Kind,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// empty on create means generate one from `generate_name`
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_name: Option<String>,
    pub namespace: String,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub annotations: Labels,
    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,
    /// while set, a delete only stamps `deletion_timestamp`, the object is
    /// removed once an update clears the flag
    #[serde(default)]
    pub finalizer: bool,
    pub creation_timestamp: Option<DateTime<Utc>>,
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resource_version: u64,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// name is generated by the store on create
    pub fn generated(namespace: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            generate_name: Some(prefix.into()),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// label or annotation set to "true"
    pub fn flag(&self, key: &str) -> bool {
        self.label(key) == Some("true") || self.annotation(key) == Some("true")
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn owner(&self, kind: Kind) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|o| o.kind == kind)
    }

    pub fn key(&self, kind: Kind) -> ObjectKey {
        ObjectKey::new(kind, self.namespace.clone(), self.name.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Pending,
    Fulfilled,
    Failed,
}

/// where a lease or pool landed in the vSphere inventory
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub datacenter: String,
    #[serde(default)]
    pub datastore: String,
    #[serde(default)]
    pub compute_cluster: String,
    #[serde(default)]
    pub resource_pool: String,
    /// inventory paths of the networks, ex. `/dc1/network/ci-vlan-1100`
    #[serde(default)]
    pub networks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LeaseSpec {
    pub vcpus: u32,
    /// GB
    pub memory: u32,
    pub networks: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_pool: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LeaseStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology: Option<Topology>,
}

/// one user's claim on capacity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub meta: ObjectMeta,
    pub spec: LeaseSpec,
    #[serde(default)]
    pub status: LeaseStatus,
}

impl Lease {
    pub fn new(meta: ObjectMeta, spec: LeaseSpec) -> Self {
        Self {
            meta,
            spec,
            status: LeaseStatus::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn is_fulfilled(&self) -> bool {
        self.status.phase == Phase::Fulfilled
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolSpec {
    #[serde(default)]
    pub server: String,
    pub vcpus: u32,
    pub memory: u32,
    /// cordoned, the scheduler places no new leases here
    #[serde(default)]
    pub no_schedule: bool,
    #[serde(default)]
    pub topology: Topology,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolStatus {
    #[serde(default)]
    pub vcpus_available: u32,
    #[serde(default)]
    pub memory_available: u32,
}

/// a slice of physical capacity that can fulfill leases
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub meta: ObjectMeta,
    pub spec: PoolSpec,
    #[serde(default)]
    pub status: PoolStatus,
}

impl Pool {
    pub fn name(&self) -> &str {
        &self.meta.name
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub port_group_name: String,
    pub machine_network_cidr: IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
    /// addresses reserved for the lease, index 2 is the API VIP and index 3
    /// the ingress VIP
    #[serde(default)]
    pub ip_addresses: Vec<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_id: Option<u16>,
}

/// a network segment bound to a fulfilled lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub meta: ObjectMeta,
    pub spec: NetworkSpec,
}

impl Network {
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// prefix length of the machine network
    pub fn cidr(&self) -> u8 {
        self.spec.machine_network_cidr.prefix_len()
    }
}

/// any object the store holds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Object {
    Lease(Lease),
    Pool(Pool),
    Network(Network),
}

impl Object {
    pub fn kind(&self) -> Kind {
        match self {
            Object::Lease(_) => Kind::Lease,
            Object::Pool(_) => Kind::Pool,
            Object::Network(_) => Kind::Network,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Object::Lease(o) => &o.meta,
            Object::Pool(o) => &o.meta,
            Object::Network(o) => &o.meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Object::Lease(o) => &mut o.meta,
            Object::Pool(o) => &mut o.meta,
            Object::Network(o) => &mut o.meta,
        }
    }

    pub fn key(&self) -> ObjectKey {
        self.meta().key(self.kind())
    }
}

/// A typed resource that can move in and out of the store.
pub trait Resource: Clone + fmt::Debug + Send + Sync + 'static {
    const KIND: Kind;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;
    fn into_object(self) -> Object;
    fn from_object(obj: Object) -> Option<Self>;

    fn key(&self) -> ObjectKey {
        self.meta().key(Self::KIND)
    }
}

macro_rules! resource {
    ($ty:ident) => {
        impl Resource for $ty {
            const KIND: Kind = Kind::$ty;

            fn meta(&self) -> &ObjectMeta {
                &self.meta
            }
            fn meta_mut(&mut self) -> &mut ObjectMeta {
                &mut self.meta
            }
            fn into_object(self) -> Object {
                Object::$ty(self)
            }
            fn from_object(obj: Object) -> Option<Self> {
                match obj {
                    Object::$ty(o) => Some(o),
                    _ => None,
                }
            }
        }
    };
}

resource!(Lease);
resource!(Pool);
resource!(Network);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_serde_tagged() {
        let mut meta = ObjectMeta::generated("ns", "user-lease-");
        meta.labels.insert("owner".into(), "alice".into());
        let lease = Lease::new(
            meta,
            LeaseSpec {
                vcpus: 4,
                memory: 16,
                networks: 1,
                required_pool: None,
            },
        );
        let json = serde_json::to_value(lease.clone().into_object()).unwrap();
        assert_eq!(json["kind"], "Lease");
        assert_eq!(json["status"]["phase"], "Pending");

        let back: Object = serde_json::from_value(json).unwrap();
        assert_eq!(Lease::from_object(back), Some(lease));
    }

    #[test]
    fn test_meta_flags() {
        let mut meta = ObjectMeta::new("ns", "a");
        assert!(!meta.flag("network-only"));
        meta.labels.insert("network-only".into(), "true".into());
        assert!(meta.flag("network-only"));
        meta.annotations.insert("disable-pruning".into(), "true".into());
        assert!(meta.flag("disable-pruning"));
        meta.annotations.insert("other".into(), "yes".into());
        assert!(!meta.flag("other"));
    }

    #[test]
    fn test_network_cidr() {
        let net = Network {
            meta: ObjectMeta::new("ns", "ci-vlan-1100"),
            spec: NetworkSpec {
                port_group_name: "ci-vlan-1100".into(),
                machine_network_cidr: "192.168.100.0/24".parse().unwrap(),
                gateway: None,
                ip_addresses: vec![],
                vlan_id: Some(1100),
            },
        };
        assert_eq!(net.cidr(), 24);
        assert_eq!(net.key().to_string(), "Network/ns/ci-vlan-1100");
    }
}
