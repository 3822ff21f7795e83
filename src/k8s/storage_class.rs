//! StorageClasses provisioned by the vSphere CSI driver.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::TopologySelectorTerm;
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::info;

use crate::error::Result;
use crate::k8s::common::{CSI_DRIVER_NAME, delete_if_exists, standard_labels};
use crate::topology::TopologyMap;

/// Storage class parameter naming the SPBM storage policy
pub const STORAGE_POLICY_PARAM: &str = "storagepolicyname";

/// Volume binding mode of a storage class
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BindingMode {
    Immediate,
    #[default]
    WaitForFirstConsumer,
}

impl BindingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Immediate => "Immediate",
            Self::WaitForFirstConsumer => "WaitForFirstConsumer",
        }
    }
}

/// Builder for a CSI storage class
#[derive(Clone, Debug)]
pub struct StorageClassBuilder {
    name: Option<String>,
    parameters: BTreeMap<String, String>,
    allowed_topologies: Vec<TopologySelectorTerm>,
    binding_mode: BindingMode,
    allow_expansion: bool,
    reclaim_policy: String,
}

impl Default for StorageClassBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageClassBuilder {
    pub fn new() -> Self {
        Self {
            name: None,
            parameters: BTreeMap::new(),
            allowed_topologies: Vec::new(),
            binding_mode: BindingMode::default(),
            allow_expansion: false,
            reclaim_policy: "Delete".to_string(),
        }
    }

    /// Fixed name; without one the server generates `sc-<suffix>`
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn storage_policy(self, policy: impl Into<String>) -> Self {
        self.parameter(STORAGE_POLICY_PARAM, policy)
    }

    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Restrict provisioning to the given topology
    pub fn allowed_topology(mut self, topology: &TopologyMap) -> Self {
        self.allowed_topologies.push(topology.selector_term());
        self
    }

    pub fn binding_mode(mut self, mode: BindingMode) -> Self {
        self.binding_mode = mode;
        self
    }

    pub fn allow_expansion(mut self, allow: bool) -> Self {
        self.allow_expansion = allow;
        self
    }

    pub fn build(self) -> StorageClass {
        StorageClass {
            metadata: ObjectMeta {
                generate_name: self.name.is_none().then(|| "sc-".to_string()),
                name: self.name,
                labels: Some(standard_labels("storage-class")),
                ..Default::default()
            },
            provisioner: CSI_DRIVER_NAME.to_string(),
            parameters: (!self.parameters.is_empty()).then_some(self.parameters),
            allowed_topologies: (!self.allowed_topologies.is_empty())
                .then_some(self.allowed_topologies),
            volume_binding_mode: Some(self.binding_mode.as_str().to_string()),
            allow_volume_expansion: Some(self.allow_expansion),
            reclaim_policy: Some(self.reclaim_policy),
            ..Default::default()
        }
    }
}

/// Create a storage class
pub async fn create_storage_class(client: &Client, sc: &StorageClass) -> Result<StorageClass> {
    let api: Api<StorageClass> = Api::all(client.clone());
    let created = api.create(&PostParams::default(), sc).await?;
    info!(
        storage_class = %created.name_any(),
        binding_mode = ?created.volume_binding_mode,
        topology = created.allowed_topologies.is_some(),
        "Created storage class"
    );
    Ok(created)
}

/// Delete a storage class; a missing class is not an error
pub async fn delete_storage_class(client: &Client, name: &str) -> Result<bool> {
    let api: Api<StorageClass> = Api::all(client.clone());
    delete_if_exists(&api, name, &DeleteParams::default()).await
}
