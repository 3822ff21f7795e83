//! Cluster node readiness and identity.

use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

use crate::error::Result;
use crate::poll::Poller;

const PROVIDER_ID_PREFIX: &str = "vsphere://";
const CONTROL_PLANE_TAINT: &str = "node-role.kubernetes.io/control-plane";

/// Whether the node reports the `Ready` condition as `True`
pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Whether workloads can be scheduled on the node
pub fn is_schedulable(node: &Node) -> bool {
    let Some(spec) = node.spec.as_ref() else {
        return true;
    };
    if spec.unschedulable == Some(true) {
        return false;
    }
    !spec.taints.as_ref().is_some_and(|taints| {
        taints
            .iter()
            .any(|t| t.effect == "NoSchedule" && t.key == CONTROL_PLANE_TAINT)
    })
}

/// VM instance UUID taken from the node's `vsphere://` provider id
pub fn node_vm_uuid(node: &Node) -> Option<String> {
    node.spec
        .as_ref()
        .and_then(|s| s.provider_id.as_deref())
        .and_then(|id| id.strip_prefix(PROVIDER_ID_PREFIX))
        .filter(|uuid| !uuid.is_empty())
        .map(|uuid| uuid.to_lowercase())
}

/// Ready nodes that accept workloads
pub async fn ready_schedulable_nodes(client: &Client) -> Result<Vec<Node>> {
    let api: Api<Node> = Api::all(client.clone());
    let nodes: Vec<Node> = api
        .list(&ListParams::default())
        .await?
        .items
        .into_iter()
        .filter(|n| is_node_ready(n) && is_schedulable(n))
        .collect();
    debug!(count = nodes.len(), "Listed ready schedulable nodes");
    Ok(nodes)
}

/// Wait until every node in the cluster is Ready
pub async fn wait_for_all_nodes_ready(client: &Client, poller: &Poller) -> Result<()> {
    let api: Api<Node> = Api::all(client.clone());
    poller
        .describe("all nodes ready")
        .poll_ignoring_errors(|| async {
            let nodes = api.list(&ListParams::default()).await?.items;
            let not_ready: Vec<String> = nodes
                .iter()
                .filter(|n| !is_node_ready(n))
                .map(|n| n.name_any())
                .collect();
            if not_ready.is_empty() {
                info!(count = nodes.len(), "All nodes ready");
                Ok(true)
            } else {
                debug!(not_ready = ?not_ready, "Waiting for nodes");
                Ok(false)
            }
        })
        .await
}

/// Wait until every named node is present and Ready again
pub async fn wait_for_nodes_up(client: &Client, names: &[String], poller: &Poller) -> Result<()> {
    let api: Api<Node> = Api::all(client.clone());
    poller
        .describe(format!("{} nodes back up", names.len()))
        .poll_ignoring_errors(|| async {
            for name in names {
                match api.get_opt(name).await? {
                    Some(node) if is_node_ready(&node) => {}
                    _ => {
                        debug!(node = %name, "Node not up yet");
                        return Ok(false);
                    }
                }
            }
            Ok(true)
        })
        .await
}
