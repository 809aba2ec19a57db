//! loads the pools & networks declared in the config file into the store
use anyhow::{Context, Result};
use config::LeaseKeeperConfig;
use leasekeeper_core::tracing::{debug, info};
use resource_store::{
    Network, NetworkSpec, ObjectMeta, Pool, PoolSpec, PoolStatus, ResourceStore, StoreError,
    Topology,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Seeded {
    pub pools: usize,
    pub networks: usize,
}

/// Objects that already exist are left alone.
pub async fn seed_store<S: ResourceStore>(store: &S, cfg: &LeaseKeeperConfig) -> Result<Seeded> {
    let ns = cfg.namespace();
    let mut seeded = Seeded::default();
    for pool in cfg.pools() {
        if created(store.create(pool_object(ns, pool)).await)
            .with_context(|| format!("failed to seed pool {}", pool.name))?
        {
            seeded.pools += 1;
        }
    }
    for network in cfg.networks() {
        if created(store.create(network_object(ns, network)).await)
            .with_context(|| format!("failed to seed network {}", network.name))?
        {
            seeded.networks += 1;
        }
    }
    info!(pools = seeded.pools, networks = seeded.networks, "seeded store");
    Ok(seeded)
}

fn created<R>(res: Result<R, StoreError>) -> Result<bool, StoreError> {
    match res {
        Ok(_) => Ok(true),
        Err(StoreError::AlreadyExists(key)) => {
            debug!(%key, "already in store");
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

fn pool_object(ns: &str, pool: &config::Pool) -> Pool {
    Pool {
        meta: ObjectMeta::new(ns, pool.name.as_str()),
        spec: PoolSpec {
            server: pool.server.clone(),
            vcpus: pool.vcpus,
            memory: pool.memory,
            no_schedule: pool.no_schedule,
            topology: Topology {
                datacenter: pool.datacenter.clone(),
                datastore: pool.datastore.clone(),
                compute_cluster: pool.compute_cluster.clone(),
                resource_pool: pool.resource_pool.clone(),
                networks: pool.networks.clone(),
            },
        },
        // nothing is leased yet
        status: PoolStatus {
            vcpus_available: pool.vcpus,
            memory_available: pool.memory,
        },
    }
}

fn network_object(ns: &str, network: &config::Network) -> Network {
    Network {
        meta: ObjectMeta::new(ns, network.name.as_str()),
        spec: NetworkSpec {
            port_group_name: network.port_group_name.clone(),
            machine_network_cidr: network.machine_network_cidr,
            gateway: network.gateway,
            ip_addresses: network.ip_addresses.clone(),
            vlan_id: network.vlan_id,
        },
    }
}
