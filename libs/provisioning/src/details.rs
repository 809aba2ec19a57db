//! messages sent to a lease owner once their lease is fulfilled
use std::{fmt::Write, net::IpAddr};

use chrono::{DateTime, SecondsFormat, Utc};
use ipnet::IpNet;
use resource_store::{Lease, Network};

use crate::{ProvisioningError, ProvisioningResult, Vips, credentials::Credentials};

/// index into a network's reserved addresses of the API VIP
pub const API_VIP_INDEX: usize = 2;
/// index into a network's reserved addresses of the ingress VIP
pub const INGRESS_VIP_INDEX: usize = 3;

/// the API & ingress VIPs reserved on `network`
pub fn vips(network: &Network) -> ProvisioningResult<Vips> {
    let addrs = &network.spec.ip_addresses;
    match (addrs.get(API_VIP_INDEX), addrs.get(INGRESS_VIP_INDEX)) {
        (Some(api), Some(ingress)) => Ok(Vips {
            api: *api,
            ingress: *ingress,
        }),
        _ => Err(ProvisioningError::NotEnoughAddresses {
            network: network.name().to_owned(),
            found: addrs.len(),
        }),
    }
}

/// Values rendered into the install-config sample.
#[derive(Debug, Clone)]
pub struct InstallConfig<'a> {
    pub cluster_name: &'a str,
    pub base_domain: &'a str,
    pub vips: Vips,
    pub machine_network: IpNet,
    pub server: &'a str,
    pub datacenter: &'a str,
    pub datastore: &'a str,
    /// last element of the network inventory path
    pub network: &'a str,
    pub compute_cluster: &'a str,
    pub resource_pool: &'a str,
    pub username: String,
    pub password: &'a str,
}

impl<'a> InstallConfig<'a> {
    pub fn new(
        lease: &'a Lease,
        network: &Network,
        creds: &'a Credentials,
        base_domain: &'a str,
        account_domain: &str,
    ) -> ProvisioningResult<Self> {
        let topology = lease
            .status
            .topology
            .as_ref()
            .ok_or_else(|| ProvisioningError::NoTopology(lease.name().to_owned()))?;
        let network_name = topology
            .networks
            .first()
            .map(|path| path.rsplit('/').next().unwrap_or(path))
            .unwrap_or_default();
        Ok(Self {
            cluster_name: lease.name(),
            base_domain,
            vips: vips(network)?,
            machine_network: network.spec.machine_network_cidr,
            server: lease.status.server.as_deref().unwrap_or_default(),
            datacenter: &topology.datacenter,
            datastore: &topology.datastore,
            network: network_name,
            compute_cluster: &topology.compute_cluster,
            resource_pool: &topology.resource_pool,
            username: creds.login(account_domain),
            password: &creds.password,
        })
    }

    pub fn render(&self) -> String {
        format!(
            r#"apiVersion: v1
baseDomain: {base_domain}
compute:
- architecture: amd64
  hyperthreading: Enabled
  name: worker
  platform:
    vsphere: {{}}
controlPlane:
  architecture: amd64
  hyperthreading: Enabled
  name: master
  platform:
    vsphere: {{}}
metadata:
  name: {cluster_name}
networking:
  machineNetwork:
  - cidr: {machine_network}
platform:
  vsphere:
    apiVIPs:
    - {api_vip}
    ingressVIPs:
    - {ingress_vip}
    vcenters:
    - server: {server}
      user: {username}
      password: {password}
      datacenters:
      - {datacenter}
    failureDomains:
    - name: fd-1
      region: us-west
      zone: us-west-1a
      server: {server}
      topology:
        computeCluster: {compute_cluster}
        datacenter: {datacenter}
        datastore: {datastore}
        resourcePool: {resource_pool}
        networks:
        - {network}
pullSecret: <your pull secret>
sshKey: |
  <your public key>"#,
            base_domain = self.base_domain,
            cluster_name = self.cluster_name,
            machine_network = self.machine_network,
            api_vip = self.vips.api,
            ingress_vip = self.vips.ingress,
            server = self.server,
            username = self.username,
            password = self.password,
            datacenter = self.datacenter,
            compute_cluster = self.compute_cluster,
            datastore = self.datastore,
            resource_pool = self.resource_pool,
            network = self.network,
        )
    }
}

/// the message a compute lease owner gets once credentials & DNS are in place
pub fn lease_details(
    lease: &Lease,
    install_config: &InstallConfig<'_>,
    expires_at: DateTime<Utc>,
    systems: &[String],
) -> String {
    let mut msg = format!(
        "Your lease has been fulfilled. You have been allocated {} vCPUs with {}GB of RAM. \
         You are only guaranteed to have access to the resources and vSphere mentioned below. \
         Do not use more resource than you have been allocated.\n\n\
         __WARNING: If leases are found to be using more cores/memory than they request, \
         they are subject to automatic deprovisioning.__\n\n\
         This lease will expire at {}. You may renew this lease up to three times. \
         DNS records have been pre-created for you.\n\n\
         Below is a sample install-config:\n\n```{}```\n",
        lease.spec.vcpus,
        lease.spec.memory,
        expires_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        install_config.render(),
    );
    if !systems.is_empty() {
        msg.push_str("\nCredentials are valid for:\n");
        for system in systems {
            let _ = writeln!(msg, "- https://{system}/");
        }
    }
    msg
}

/// the message a network-only lease owner gets
pub fn network_details(network: &Network) -> String {
    let gateway = network
        .spec
        .gateway
        .map(|gw: IpAddr| gw.to_string())
        .unwrap_or_else(|| "n/a".to_owned());
    format!(
        "Your network only lease is ready. You can use this portgroup in addition to the \
         portgroup included in the install-config.yaml.\n\
         ```Portgroup: {}\nCIDR: {}\nGateway: {}```",
        network.spec.port_group_name, network.spec.machine_network_cidr, gateway
    )
}
