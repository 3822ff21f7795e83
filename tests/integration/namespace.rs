//! Per-test namespaces.
//!
//! Each scenario works in its own namespace, torn down when the test ends.
//! Teardown removes StatefulSets, pods and claims before the namespace
//! itself so the CSI driver detaches and deletes volumes instead of leaving
//! them behind on the datastore.
//!
//! Tests holding a `TestNamespace` must run on the multi-thread runtime:
//! `#[tokio::test(flavor = "multi_thread")]`.

use std::fmt::Debug;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Namespace, PersistentVolumeClaim, Pod};
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams, PropagationPolicy};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use uuid::Uuid;
use vsphere_csi_e2e::k8s::common::{delete_if_exists, immediate_delete, standard_labels};
use vsphere_csi_e2e::k8s::service::create_headless_service;

/// A namespace deleted, together with its volumes, when dropped
pub struct TestNamespace {
    client: Client,
    name: String,
}

impl TestNamespace {
    /// Create `{prefix}-{8 hex chars}`
    pub async fn create(client: Client, prefix: &str) -> Self {
        let name = format!("{}-{}", prefix, &Uuid::new_v4().simple().to_string()[..8]);

        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                labels: Some(standard_labels(prefix)),
                ..Default::default()
            },
            ..Default::default()
        };
        Api::<Namespace>::all(client.clone())
            .create(&PostParams::default(), &namespace)
            .await
            .unwrap_or_else(|e| panic!("Failed to create namespace {}: {}", name, e));
        tracing::info!(namespace = %name, "Created test namespace");

        Self { client, name }
    }

    /// Namespace plus the headless service the nginx StatefulSets point at
    pub async fn with_headless_service(client: Client, prefix: &str) -> Self {
        let ns = Self::create(client, prefix).await;
        create_headless_service(&ns.client, &ns.name)
            .await
            .unwrap_or_else(|e| panic!("Failed to create headless service in {}: {}", ns.name, e));
        ns
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespaced API handle
    pub fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = kube::core::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.name)
    }

    async fn delete_all<K>(client: &Client, namespace: &str, params: &DeleteParams)
    where
        K: Resource<Scope = kube::core::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(client.clone(), namespace);
        if let Err(e) = api.delete_collection(params, &ListParams::default()).await {
            let kind = K::kind(&K::DynamicType::default()).to_string();
            tracing::debug!(namespace = %namespace, kind = %kind, error = %e, "Drop: bulk delete failed");
        }
    }
}

impl Drop for TestNamespace {
    fn drop(&mut self) {
        let name = self.name.clone();
        let client = self.client.clone();
        tracing::debug!(namespace = %name, "Drop: tearing down test namespace");

        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(async {
                let foreground = DeleteParams {
                    propagation_policy: Some(PropagationPolicy::Foreground),
                    ..Default::default()
                };
                // Pods release their claims before the claims go
                Self::delete_all::<StatefulSet>(&client, &name, &foreground).await;
                Self::delete_all::<Pod>(&client, &name, &immediate_delete()).await;
                Self::delete_all::<PersistentVolumeClaim>(&client, &name, &DeleteParams::default())
                    .await;

                let background = DeleteParams {
                    propagation_policy: Some(PropagationPolicy::Background),
                    ..Default::default()
                };
                let namespaces: Api<Namespace> = Api::all(client);
                if let Err(e) = delete_if_exists(&namespaces, &name, &background).await {
                    tracing::warn!(namespace = %name, error = %e, "Drop: failed to delete namespace");
                }
            });
        });
    }
}
