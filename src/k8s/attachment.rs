//! Volume attachment state as reported by `VolumeAttachment` objects.

use k8s_openapi::api::storage::v1::VolumeAttachment;
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::debug;

use crate::error::Result;
use crate::k8s::common::CSI_DRIVER_NAME;
use crate::poll::Poller;

/// Whether `attachment` is the driver's attachment of `volume` to `node`
pub fn matches(attachment: &VolumeAttachment, volume: &str, node: &str) -> bool {
    let spec = &attachment.spec;
    spec.attacher == CSI_DRIVER_NAME
        && spec.node_name == node
        && spec.source.persistent_volume_name.as_deref() == Some(volume)
}

/// Whether the attachment reports `attached: true`
pub fn is_attached(attachment: &VolumeAttachment) -> bool {
    attachment.status.as_ref().is_some_and(|s| s.attached)
}

async fn attachments(client: &Client) -> Result<Vec<VolumeAttachment>> {
    let api: Api<VolumeAttachment> = Api::all(client.clone());
    Ok(api.list(&ListParams::default()).await?.items)
}

/// Whether the driver reports `volume` attached to `node`
pub async fn is_volume_attached(client: &Client, volume: &str, node: &str) -> Result<bool> {
    let attached = attachments(client)
        .await?
        .iter()
        .any(|va| matches(va, volume, node) && is_attached(va));
    debug!(volume = %volume, node = %node, attached, "Checked volume attachment");
    Ok(attached)
}

/// Wait until `volume` is no longer attached to `node`
pub async fn wait_for_volume_detached(
    client: &Client,
    volume: &str,
    node: &str,
    poller: &Poller,
) -> Result<()> {
    poller
        .describe(format!("volume {} detached from {}", volume, node))
        .poll_immediate(|| async { Ok(!is_volume_attached(client, volume, node).await?) })
        .await
}
