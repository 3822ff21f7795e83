//! Headless service fronting the suite's StatefulSets.

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::info;

use crate::error::Result;
use crate::k8s::common::{delete_if_exists, standard_labels};
use crate::k8s::statefulset::SERVICE_NAME;

const WEB_PORT: i32 = 80;

/// Generate the headless service that gives StatefulSet pods stable DNS names.
///
/// The selector only uses the shared `app` label so one service covers
/// every StatefulSet created in the namespace.
pub fn headless_service(namespace: &str) -> Service {
    let labels = standard_labels(SERVICE_NAME);
    let mut selector = std::collections::BTreeMap::new();
    selector.insert("app".to_string(), SERVICE_NAME.to_string());

    Service {
        metadata: ObjectMeta {
            name: Some(SERVICE_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                port: WEB_PORT,
                target_port: Some(IntOrString::String("web".to_string())),
                name: Some("web".to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Create the headless service in `namespace`
pub async fn create_headless_service(client: &Client, namespace: &str) -> Result<Service> {
    let api: Api<Service> = Api::namespaced(client.clone(), namespace);
    let created = api
        .create(&PostParams::default(), &headless_service(namespace))
        .await?;
    info!(namespace = %namespace, service = %created.name_any(), "Created headless service");
    Ok(created)
}

/// Delete the headless service; a missing service is not an error
pub async fn delete_headless_service(client: &Client, namespace: &str) -> Result<bool> {
    let api: Api<Service> = Api::namespaced(client.clone(), namespace);
    delete_if_exists(&api, SERVICE_NAME, &DeleteParams::default()).await
}
