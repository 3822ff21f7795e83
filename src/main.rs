//! vsphere-csi-e2e preflight
//!
//! Checks that the environment the scenarios need is in place before a long
//! run starts:
//! - configuration parses
//! - the cluster is reachable and has ready, schedulable nodes
//! - nodes carry the configured topology labels
//! - vCenter accepts the credentials and knows the topology clusters

use std::collections::BTreeMap;

use kube::{Client, ResourceExt};
use tracing::{info, warn};

use vsphere_csi_e2e::k8s::nodes::{node_vm_uuid, ready_schedulable_nodes};
use vsphere_csi_e2e::topology::{TOPOLOGY_LABEL_PREFIX, topology_key, zone_distribution};
use vsphere_csi_e2e::{E2eConfig, Error, Hypervisor, TestbedInfo, VsphereClient};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vsphere_csi_e2e=info".parse()?)
                .add_directive("kube=warn".parse()?),
        )
        .json()
        .init();

    let config = E2eConfig::from_env()?;
    info!(
        topology_levels = config.topology.as_ref().map(|t| t.levels()),
        clusters = ?config.topology_clusters,
        vcenter = config.vcenter.as_ref().map(|v| v.host.as_str()),
        "Loaded configuration"
    );

    let client = Client::try_default().await?;
    let nodes = ready_schedulable_nodes(&client).await?;
    if nodes.is_empty() {
        return Err(Error::Assertion("cluster has no ready schedulable nodes".to_string()).into());
    }

    for node in &nodes {
        let topology: BTreeMap<&str, &str> = node
            .labels()
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(TOPOLOGY_LABEL_PREFIX)
                    .map(|category| (category, v.as_str()))
            })
            .collect();
        info!(
            node = %node.name_any(),
            vm_uuid = node_vm_uuid(node).as_deref(),
            topology = ?topology,
            "Ready node"
        );
    }

    if let Some(topology) = &config.topology {
        let allowed = topology.allowed_topologies();
        let mut missing = Vec::new();
        for node in &nodes {
            if let Err(e) = vsphere_csi_e2e::topology::verify_node_in_topology(
                &node.name_any(),
                node.labels(),
                &allowed,
            ) {
                missing.push(e.to_string());
            }
        }
        if let Some(category) = topology.category_names().last() {
            let spread = zone_distribution(nodes.iter(), &topology_key(category));
            info!(category = %category, spread = ?spread, "Node distribution");
        }
        if !missing.is_empty() {
            return Err(Error::Multiple(missing).into());
        }
    }

    if let Some(path) = &config.testbed_info_path {
        let testbed = TestbedInfo::load(path).await?;
        info!(hosts = testbed.esx_hosts.len(), "Loaded testbed info");
    }

    match &config.vcenter {
        Some(credentials) => {
            let vc = VsphereClient::connect(credentials.clone()).await?;
            for cluster in &config.topology_clusters {
                let hosts = vc.cluster_hosts(cluster).await?;
                let connected = hosts.iter().filter(|h| h.is_connected()).count();
                info!(
                    cluster = %cluster,
                    hosts = hosts.len(),
                    connected,
                    "vCenter cluster"
                );
            }
            vc.logout().await?;
        }
        None => warn!("vCenter credentials not set, power and service scenarios will fail"),
    }

    info!("Preflight passed");
    Ok(())
}
