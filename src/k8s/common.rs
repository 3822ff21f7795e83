//! Shared labels, constants and small API helpers.

use std::collections::BTreeMap;
use std::fmt::Debug;

use kube::api::{Api, DeleteParams};
use kube::Resource;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::Result;

/// CSI driver (provisioner and attacher) name
pub const CSI_DRIVER_NAME: &str = "csi.vsphere.vmware.com";

/// Label marking objects created by this suite
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Value of [`MANAGED_BY_LABEL`]
pub const MANAGED_BY_VALUE: &str = "vsphere-csi-e2e";

/// Standard labels applied to every workload the suite creates
pub fn standard_labels(app: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), app.to_string());
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
    labels
}

/// Render a label map as a selector string (`k=v,k2=v2`)
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Delete an object, treating "already gone" as success.
///
/// Returns `true` when a delete was issued.
pub async fn delete_if_exists<K>(api: &Api<K>, name: &str, params: &DeleteParams) -> Result<bool>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    match api.delete(name, params).await {
        Ok(_) => {
            info!(name = %name, kind = %std::any::type_name::<K>(), "Deleted");
            Ok(true)
        }
        Err(kube::Error::Api(e)) if e.code == 404 => {
            debug!(name = %name, "Already deleted");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// Delete with a zero grace period, the way the scenarios clean up
pub fn immediate_delete() -> DeleteParams {
    DeleteParams {
        grace_period_seconds: Some(0),
        ..Default::default()
    }
}
