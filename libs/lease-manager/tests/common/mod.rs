#![allow(dead_code)]
use std::{
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use config::{AdminCredentials, LeaseKeeperConfig, Reconcile};
use lease_manager::{
    Collaborators, LeaseManager, ProvisionWorker, Settings,
};
use parking_lot::Mutex;
use provisioning::{
    AccountManager, AccountRequest, DnsRecords, Messenger, ProvisioningError,
    ProvisioningResult, Vips,
};
use resource_store::{
    Kind, Lease, MemoryStore, Network, NetworkSpec, ObjectMeta, OwnerReference, Phase, Pool,
    PoolSpec, PoolStatus, ResourceStore, Topology,
};

pub const NS: &str = "leasekeeper-test";
pub const SYSTEMS: [&str; 2] = ["vcenter-1.example.com", "vcenter-2.example.com"];
pub const DOMAIN: &str = "ci.example.com";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateAccount { system: String, username: String, password: String },
    DeleteAccount { system: String, username: String },
    UpsertDns { domain: String, vips: Vips },
    DeleteDns { domain: String, vips: Vips },
    Message { user: String, content: String },
}

/// Records every collaborator call. Each capability can be switched to fail.
#[derive(Debug, Default)]
pub struct Fakes {
    calls: Mutex<Vec<Call>>,
    pub fail_accounts: AtomicBool,
    pub fail_dns: AtomicBool,
    pub fail_messages: AtomicBool,
}

impl Fakes {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn messages_to(&self, user: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Message { user: to, content } if to == user => Some(content),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|call| pred(call)).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    pub fn set_fail_accounts(&self, fail: bool) {
        self.fail_accounts.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_dns(&self, fail: bool) {
        self.fail_dns.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_messages(&self, fail: bool) {
        self.fail_messages.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl AccountManager for Fakes {
    async fn create_account(
        &self,
        system: &str,
        request: AccountRequest<'_>,
    ) -> ProvisioningResult<()> {
        if self.fail_accounts.load(Ordering::SeqCst) {
            return Err(ProvisioningError::CreateAccount {
                system: system.to_owned(),
                username: request.username.to_owned(),
                reason: "sso unavailable".to_owned(),
            });
        }
        self.record(Call::CreateAccount {
            system: system.to_owned(),
            username: request.username.to_owned(),
            password: request.password.to_owned(),
        });
        Ok(())
    }

    async fn delete_account(
        &self,
        system: &str,
        username: &str,
        _admin: &AdminCredentials,
    ) -> ProvisioningResult<()> {
        if self.fail_accounts.load(Ordering::SeqCst) {
            return Err(ProvisioningError::DeleteAccount {
                system: system.to_owned(),
                username: username.to_owned(),
                reason: "sso unavailable".to_owned(),
            });
        }
        self.record(Call::DeleteAccount {
            system: system.to_owned(),
            username: username.to_owned(),
        });
        Ok(())
    }
}

#[async_trait]
impl DnsRecords for Fakes {
    async fn upsert_records(&self, vips: Vips, domain_name: &str) -> ProvisioningResult<()> {
        if self.fail_dns.load(Ordering::SeqCst) {
            return Err(ProvisioningError::Dns {
                domain: domain_name.to_owned(),
                reason: "REFUSED".to_owned(),
            });
        }
        self.record(Call::UpsertDns {
            domain: domain_name.to_owned(),
            vips,
        });
        Ok(())
    }

    async fn delete_records(&self, vips: Vips, domain_name: &str) -> ProvisioningResult<()> {
        if self.fail_dns.load(Ordering::SeqCst) {
            return Err(ProvisioningError::Dns {
                domain: domain_name.to_owned(),
                reason: "REFUSED".to_owned(),
            });
        }
        self.record(Call::DeleteDns {
            domain: domain_name.to_owned(),
            vips,
        });
        Ok(())
    }
}

#[async_trait]
impl Messenger for Fakes {
    async fn send_direct_message(&self, user: &str, content: &str) -> ProvisioningResult<()> {
        if self.fail_messages.load(Ordering::SeqCst) {
            return Err(ProvisioningError::Messaging {
                user: user.to_owned(),
                reason: "user not found".to_owned(),
            });
        }
        self.record(Call::Message {
            user: user.to_owned(),
            content: content.to_owned(),
        });
        Ok(())
    }
}

pub fn settings() -> Settings {
    let defaults = LeaseKeeperConfig::default();
    let mut provisioning = defaults.provisioning().clone();
    provisioning.domain_name = DOMAIN.to_owned();
    provisioning.systems = SYSTEMS.iter().map(|s| s.to_string()).collect();
    provisioning.admin = AdminCredentials::new("administrator@vsphere.local", "hunter2");
    provisioning.requeue_delay = Duration::from_millis(20);
    provisioning.queue_capacity = 16;
    Settings::from_parts(
        NS,
        *defaults.leases(),
        provisioning,
        Reconcile {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            max_retries: 3,
        },
    )
    .unwrap()
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub fakes: Arc<Fakes>,
    pub manager: LeaseManager<MemoryStore>,
    pub worker: ProvisionWorker<MemoryStore>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let fakes = Arc::new(Fakes::default());
        let collaborators = Collaborators::new(fakes.clone(), fakes.clone(), fakes.clone());
        let (manager, worker) = LeaseManager::new(store.clone(), collaborators, settings());
        Self {
            store,
            fakes,
            manager,
            worker,
        }
    }

    pub async fn seed_pool(&self, name: &str) -> Pool {
        self.store
            .create(Pool {
                meta: ObjectMeta::new(NS, name),
                spec: PoolSpec {
                    server: "vcenter-1.example.com".into(),
                    vcpus: 120,
                    memory: 1600,
                    no_schedule: false,
                    topology: topology(),
                },
                status: PoolStatus {
                    vcpus_available: 96,
                    memory_available: 1280,
                },
            })
            .await
            .unwrap()
    }

    pub async fn seed_network(&self, name: &str, addresses: usize) -> Network {
        let ip_addresses = (0..addresses)
            .map(|i| IpAddr::from([192, 168, 100, 10 + i as u8]))
            .collect();
        self.store
            .create(Network {
                meta: ObjectMeta::new(NS, name),
                spec: NetworkSpec {
                    port_group_name: format!("ci-vlan-{name}"),
                    machine_network_cidr: "192.168.100.0/24".parse().unwrap(),
                    gateway: Some("192.168.100.1".parse().unwrap()),
                    ip_addresses,
                    vlan_id: Some(100),
                },
            })
            .await
            .unwrap()
    }

    /// what the external scheduler does once it places a lease
    pub async fn fulfill(&self, lease: &str, network: Option<&str>) -> Lease {
        let mut lease = self.lease(lease).await;
        lease.status.phase = Phase::Fulfilled;
        lease.status.server = Some("vcenter-1.example.com".into());
        lease.status.topology = Some(topology());
        if let Some(network) = network {
            lease.meta.owner_references.push(OwnerReference {
                kind: Kind::Network,
                name: network.to_owned(),
            });
        }
        self.store.update(lease).await.unwrap()
    }

    pub async fn lease(&self, name: &str) -> Lease {
        self.store.get::<Lease>(NS, name).await.unwrap()
    }

    pub async fn try_lease(&self, name: &str) -> Option<Lease> {
        self.store.get::<Lease>(NS, name).await.ok()
    }

    /// drain the provisioning queue
    pub fn queued(&mut self) -> Vec<String> {
        std::iter::from_fn(|| self.worker.try_next()).collect()
    }
}

pub fn topology() -> Topology {
    Topology {
        datacenter: "cidatacenter".into(),
        datastore: "/cidatacenter/datastore/vsanDatastore".into(),
        compute_cluster: "/cidatacenter/host/cicluster".into(),
        resource_pool: "/cidatacenter/host/cicluster/Resources".into(),
        networks: vec!["/cidatacenter/network/ci-vlan-1".into()],
    }
}

/// poll `check` until it holds or a second has passed
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
