//! CSI volume snapshots (`snapshot.storage.k8s.io/v1`).
//!
//! `VolumeSnapshot` is typed since the suite reads its status.
//! `VolumeSnapshotClass` and `VolumeSnapshotContent` are only created,
//! deleted or checked for existence, so they go through `DynamicObject`.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, PostParams};
use kube::{Client, CustomResource, ResourceExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::error::Result;
use crate::k8s::common::{CSI_DRIVER_NAME, delete_if_exists, standard_labels};
use crate::poll::Poller;

pub const SNAPSHOT_GROUP: &str = "snapshot.storage.k8s.io";
pub const SNAPSHOT_VERSION: &str = "v1";

/// Desired state of a VolumeSnapshot
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize)]
#[kube(
    group = "snapshot.storage.k8s.io",
    version = "v1",
    kind = "VolumeSnapshot",
    plural = "volumesnapshots",
    status = "VolumeSnapshotStatus",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_class_name: Option<String>,
    pub source: VolumeSnapshotSource,
}

/// What the snapshot is taken from
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_content_name: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_volume_snapshot_content_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<VolumeSnapshotError>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct VolumeSnapshotError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A snapshot that is ready to restore from
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadySnapshot {
    pub content_name: String,
    pub restore_size: Option<String>,
}

/// `Some` once the snapshot is bound to content and ready to use
pub fn ready_snapshot(snapshot: &VolumeSnapshot) -> Option<ReadySnapshot> {
    let status = snapshot.status.as_ref()?;
    if status.ready_to_use != Some(true) {
        return None;
    }
    Some(ReadySnapshot {
        content_name: status.bound_volume_snapshot_content_name.clone()?,
        restore_size: status.restore_size.clone(),
    })
}

fn snapshot_resource(kind: &str, plural: &str) -> ApiResource {
    ApiResource {
        group: SNAPSHOT_GROUP.to_string(),
        version: SNAPSHOT_VERSION.to_string(),
        kind: kind.to_string(),
        api_version: format!("{}/{}", SNAPSHOT_GROUP, SNAPSHOT_VERSION),
        plural: plural.to_string(),
    }
}

fn class_resource() -> ApiResource {
    snapshot_resource("VolumeSnapshotClass", "volumesnapshotclasses")
}

fn content_resource() -> ApiResource {
    snapshot_resource("VolumeSnapshotContent", "volumesnapshotcontents")
}

/// VolumeSnapshotClass for the CSI driver with `Delete` policy
pub fn snapshot_class(name: &str) -> DynamicObject {
    let mut obj = DynamicObject::new(name, &class_resource());
    obj.metadata = ObjectMeta {
        name: Some(name.to_string()),
        labels: Some(standard_labels("snapshot-class")),
        ..Default::default()
    };
    obj.data = json!({
        "driver": CSI_DRIVER_NAME,
        "deletionPolicy": "Delete",
    });
    obj
}

/// Create a snapshot class
pub async fn create_snapshot_class(client: &Client, name: &str) -> Result<DynamicObject> {
    let api: Api<DynamicObject> = Api::all_with(client.clone(), &class_resource());
    let created = api.create(&PostParams::default(), &snapshot_class(name)).await?;
    info!(snapshot_class = %name, "Created snapshot class");
    Ok(created)
}

/// Delete a snapshot class; a missing class is not an error
pub async fn delete_snapshot_class(client: &Client, name: &str) -> Result<bool> {
    let api: Api<DynamicObject> = Api::all_with(client.clone(), &class_resource());
    delete_if_exists(&api, name, &DeleteParams::default()).await
}

/// Snapshot `claim` in `namespace` using `class`
pub async fn create_volume_snapshot(
    client: &Client,
    namespace: &str,
    class: &str,
    claim: &str,
) -> Result<VolumeSnapshot> {
    let mut snapshot = VolumeSnapshot::new(
        "",
        VolumeSnapshotSpec {
            volume_snapshot_class_name: Some(class.to_string()),
            source: VolumeSnapshotSource {
                persistent_volume_claim_name: Some(claim.to_string()),
                volume_snapshot_content_name: None,
            },
        },
    );
    snapshot.metadata = ObjectMeta {
        generate_name: Some("snapshot-".to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(standard_labels("snapshot")),
        ..Default::default()
    };

    let api: Api<VolumeSnapshot> = Api::namespaced(client.clone(), namespace);
    let created = api.create(&PostParams::default(), &snapshot).await?;
    info!(namespace = %namespace, snapshot = %created.name_any(), claim = %claim, "Created volume snapshot");
    Ok(created)
}

/// Wait for the snapshot to be ready and return its content and size
pub async fn wait_for_snapshot_ready(
    client: &Client,
    namespace: &str,
    name: &str,
    poller: &Poller,
) -> Result<ReadySnapshot> {
    let api: Api<VolumeSnapshot> = Api::namespaced(client.clone(), namespace);
    poller
        .describe(format!("snapshot {}/{} ready to use", namespace, name))
        .poll_value(|| async {
            let snapshot = api.get(name).await?;
            if let Some(message) = snapshot
                .status
                .as_ref()
                .and_then(|s| s.error.as_ref())
                .and_then(|e| e.message.as_deref())
            {
                debug!(snapshot = %name, error = %message, "Snapshot reports an error");
            }
            Ok(ready_snapshot(&snapshot))
        })
        .await
}

/// Delete a volume snapshot; a missing snapshot is not an error
pub async fn delete_volume_snapshot(client: &Client, namespace: &str, name: &str) -> Result<bool> {
    let api: Api<VolumeSnapshot> = Api::namespaced(client.clone(), namespace);
    delete_if_exists(&api, name, &DeleteParams::default()).await
}

/// Wait until the snapshot content backing a deleted snapshot is gone
pub async fn wait_for_snapshot_content_deleted(
    client: &Client,
    content_name: &str,
    poller: &Poller,
) -> Result<()> {
    let api: Api<DynamicObject> = Api::all_with(client.clone(), &content_resource());
    poller
        .describe(format!("snapshot content {} deleted", content_name))
        .poll_immediate(|| async { Ok(api.get_opt(content_name).await?.is_none()) })
        .await
}
