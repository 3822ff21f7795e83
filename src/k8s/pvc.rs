//! PersistentVolumeClaims and the volumes bound to them.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    TypedLocalObjectReference, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::k8s::common::{delete_if_exists, standard_labels};
use crate::poll::Poller;

/// Annotation set by the scheduler on claims using `WaitForFirstConsumer`
pub const SELECTED_NODE_ANNOTATION: &str = "volume.kubernetes.io/selected-node";

/// Builder for a PersistentVolumeClaim
#[derive(Clone, Debug)]
pub struct PvcBuilder {
    namespace: String,
    name: Option<String>,
    size: String,
    storage_class: Option<String>,
    access_mode: String,
    snapshot: Option<String>,
}

impl PvcBuilder {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: None,
            size: "2Gi".to_string(),
            storage_class: None,
            access_mode: "ReadWriteOnce".to_string(),
            snapshot: None,
        }
    }

    /// Fixed name; without one the server generates `pvc-<suffix>`
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn size(mut self, size: impl Into<String>) -> Self {
        self.size = size.into();
        self
    }

    pub fn storage_class(mut self, storage_class: impl Into<String>) -> Self {
        self.storage_class = Some(storage_class.into());
        self
    }

    pub fn access_mode(mut self, mode: impl Into<String>) -> Self {
        self.access_mode = mode.into();
        self
    }

    /// Restore the claim from a VolumeSnapshot in the same namespace
    pub fn from_snapshot(mut self, snapshot: impl Into<String>) -> Self {
        self.snapshot = Some(snapshot.into());
        self
    }

    pub fn build(self) -> PersistentVolumeClaim {
        let mut requests = BTreeMap::new();
        requests.insert("storage".to_string(), Quantity(self.size));

        PersistentVolumeClaim {
            metadata: ObjectMeta {
                generate_name: self.name.is_none().then(|| "pvc-".to_string()),
                name: self.name,
                namespace: Some(self.namespace),
                labels: Some(standard_labels("pvc")),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec![self.access_mode]),
                storage_class_name: self.storage_class,
                resources: Some(VolumeResourceRequirements {
                    requests: Some(requests),
                    ..Default::default()
                }),
                data_source: self.snapshot.map(|name| TypedLocalObjectReference {
                    api_group: Some(crate::k8s::snapshot::SNAPSHOT_GROUP.to_string()),
                    kind: "VolumeSnapshot".to_string(),
                    name,
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Whether the claim has a deletion timestamp
pub fn is_terminating(claim: &PersistentVolumeClaim) -> bool {
    claim.metadata.deletion_timestamp.is_some()
}

/// Node chosen for a delayed-binding claim, if the scheduler has picked one
pub fn selected_node(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim
        .annotations()
        .get(SELECTED_NODE_ANNOTATION)
        .map(String::as_str)
}

/// Whether the claim reports phase `Bound`
pub fn is_bound(claim: &PersistentVolumeClaim) -> bool {
    claim
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == "Bound")
}

/// Create a claim and return the server's copy
pub async fn create_pvc(client: &Client, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
    let namespace = claim.namespace().unwrap_or_default();
    let api: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), &namespace);
    let created = api.create(&PostParams::default(), claim).await?;
    info!(
        namespace = %namespace,
        claim = %created.name_any(),
        storage_class = ?created.spec.as_ref().and_then(|s| s.storage_class_name.as_deref()),
        "Created claim"
    );
    Ok(created)
}

/// All claims in a namespace
pub async fn list_claims(client: &Client, namespace: &str) -> Result<Vec<PersistentVolumeClaim>> {
    let api: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);
    Ok(api.list(&ListParams::default()).await?.items)
}

/// Wait for every named claim to be Bound and return their volumes in order
pub async fn wait_for_claims_bound(
    client: &Client,
    namespace: &str,
    claims: &[String],
    poller: &Poller,
) -> Result<Vec<PersistentVolume>> {
    let api: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);
    poller
        .describe(format!("{} claims in {} bound", claims.len(), namespace))
        .poll_ignoring_errors(|| async {
            for name in claims {
                if !is_bound(&api.get(name).await?) {
                    debug!(claim = %name, "Claim not bound yet");
                    return Ok(false);
                }
            }
            Ok(true)
        })
        .await?;

    let mut volumes = Vec::with_capacity(claims.len());
    for name in claims {
        volumes.push(pv_for_claim(client, namespace, name).await?);
    }
    Ok(volumes)
}

/// The PersistentVolume bound to a claim
pub async fn pv_for_claim(client: &Client, namespace: &str, claim: &str) -> Result<PersistentVolume> {
    let claims: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);
    let pvc = claims.get(claim).await?;
    let volume = pvc
        .spec
        .as_ref()
        .and_then(|s| s.volume_name.clone())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            Error::Assertion(format!("claim {}/{} is not bound to a volume", namespace, claim))
        })?;
    let volumes: Api<PersistentVolume> = Api::all(client.clone());
    Ok(volumes.get(&volume).await?)
}

/// Delete a claim; a missing claim is not an error
pub async fn delete_pvc(client: &Client, namespace: &str, name: &str) -> Result<bool> {
    let api: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);
    delete_if_exists(&api, name, &DeleteParams::default()).await
}

/// Wait for the provisioner to remove a volume after its claim was deleted
pub async fn wait_for_pv_deleted(client: &Client, volume: &str, poller: &Poller) -> Result<()> {
    let api: Api<PersistentVolume> = Api::all(client.clone());
    poller
        .describe(format!("volume {} deleted", volume))
        .poll_immediate(|| async { Ok(api.get_opt(volume).await?.is_none()) })
        .await
}
