//! StatefulSet construction, readiness, scaling and bulk deletion.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::LazyLock;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, NodeAffinity, NodeSelector, NodeSelectorRequirement,
    NodeSelectorTerm, PersistentVolumeClaim, PersistentVolumeClaimSpec, Pod, PodSpec,
    PodTemplateSpec, TopologySelectorLabelRequirement, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use regex::Regex;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::fanout;
use crate::k8s::attachment;
use crate::k8s::common::{delete_if_exists, immediate_delete, label_selector, standard_labels};
use crate::k8s::pod::{exec_in_pod, is_pod_ready, is_pod_running, pod_node_name};
use crate::k8s::pvc;
use crate::poll::Poller;

/// Where the nginx container mounts its claim
pub const MOUNT_PATH: &str = "/usr/share/nginx/html";
/// Name of the volume claim template
pub const CLAIM_TEMPLATE_NAME: &str = "www";
/// Headless service shared by the suite's StatefulSets
pub const SERVICE_NAME: &str = "nginx";
/// Label carrying the owning StatefulSet's name on its pods
pub const STATEFULSET_LABEL: &str = "e2e.csi.vsphere.vmware.com/statefulset";

static ORDINAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"(.*)-([0-9]+)$").expect("ordinal pattern is valid")
});

/// Trailing ordinal of a StatefulSet pod name.
///
/// `-1` when the name has no numeric suffix or it overflows `i32`.
pub fn pod_ordinal(name: &str) -> i32 {
    ORDINAL_RE
        .captures(name)
        .and_then(|caps| caps.get(2))
        .and_then(|m| m.as_str().parse::<i32>().ok())
        .unwrap_or(-1)
}

/// StatefulSet pod management policy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PodManagementPolicy {
    #[default]
    OrderedReady,
    Parallel,
}

impl PodManagementPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OrderedReady => "OrderedReady",
            Self::Parallel => "Parallel",
        }
    }
}

/// Builder for an nginx StatefulSet with one claim template
#[derive(Clone, Debug)]
pub struct StatefulSetBuilder {
    name: String,
    namespace: String,
    replicas: i32,
    policy: PodManagementPolicy,
    storage_class: Option<String>,
    image: String,
    claim_size: String,
    service_name: String,
    node_affinity: Vec<TopologySelectorLabelRequirement>,
}

impl StatefulSetBuilder {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            replicas: 3,
            policy: PodManagementPolicy::default(),
            storage_class: None,
            image: crate::config::DEFAULT_STATEFULSET_IMAGE.to_string(),
            claim_size: "1Gi".to_string(),
            service_name: SERVICE_NAME.to_string(),
            node_affinity: Vec::new(),
        }
    }

    pub fn replicas(mut self, replicas: i32) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn policy(mut self, policy: PodManagementPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Storage class for the claim template; `None` uses the cluster default
    pub fn storage_class(mut self, storage_class: impl Into<String>) -> Self {
        self.storage_class = Some(storage_class.into());
        self
    }

    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn claim_size(mut self, size: impl Into<String>) -> Self {
        self.claim_size = size.into();
        self
    }

    pub fn service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self
    }

    /// Require pods to land on nodes matching the given topology
    pub fn node_affinity(mut self, allowed: Vec<TopologySelectorLabelRequirement>) -> Self {
        self.node_affinity = allowed;
        self
    }

    fn selector_labels(&self) -> BTreeMap<String, String> {
        let mut labels = standard_labels(SERVICE_NAME);
        labels.insert(STATEFULSET_LABEL.to_string(), self.name.clone());
        labels
    }

    pub fn build(self) -> StatefulSet {
        let labels = self.selector_labels();

        let affinity = (!self.node_affinity.is_empty()).then(|| Affinity {
            node_affinity: Some(NodeAffinity {
                required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                    node_selector_terms: vec![NodeSelectorTerm {
                        match_expressions: Some(
                            self.node_affinity
                                .iter()
                                .map(|req| NodeSelectorRequirement {
                                    key: req.key.clone(),
                                    operator: "In".to_string(),
                                    values: Some(req.values.clone()),
                                })
                                .collect(),
                        ),
                        ..Default::default()
                    }],
                }),
                ..Default::default()
            }),
            ..Default::default()
        });

        let mut requests = BTreeMap::new();
        requests.insert("storage".to_string(), Quantity(self.claim_size.clone()));

        StatefulSet {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                replicas: Some(self.replicas),
                pod_management_policy: Some(self.policy.as_str().to_string()),
                service_name: Some(self.service_name),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "nginx".to_string(),
                            image: Some(self.image),
                            ports: Some(vec![ContainerPort {
                                container_port: 80,
                                name: Some("web".to_string()),
                                ..Default::default()
                            }]),
                            volume_mounts: Some(vec![VolumeMount {
                                name: CLAIM_TEMPLATE_NAME.to_string(),
                                mount_path: MOUNT_PATH.to_string(),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }],
                        affinity,
                        termination_grace_period_seconds: Some(10),
                        ..Default::default()
                    }),
                },
                volume_claim_templates: Some(vec![PersistentVolumeClaim {
                    metadata: ObjectMeta {
                        name: Some(CLAIM_TEMPLATE_NAME.to_string()),
                        ..Default::default()
                    },
                    spec: Some(PersistentVolumeClaimSpec {
                        access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                        storage_class_name: self.storage_class,
                        resources: Some(VolumeResourceRequirements {
                            requests: Some(requests),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Names used for StatefulSets created side by side in one namespace
pub fn parallel_statefulset_name(index: usize) -> String {
    format!("thread-{}-web", index)
}

/// Build `count` identically shaped StatefulSets with distinct names
pub fn parallel_statefulsets(
    namespace: &str,
    count: usize,
    template: &StatefulSetBuilder,
) -> Vec<StatefulSet> {
    (0..count)
        .map(|i| {
            let mut builder = template.clone();
            builder.name = parallel_statefulset_name(i);
            builder.namespace = namespace.to_string();
            builder.build()
        })
        .collect()
}

/// Desired replica count, defaulting to 1 as the API server does
pub fn desired_replicas(sts: &StatefulSet) -> i32 {
    sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
}

/// Names of the claims a StatefulSet pod mounts from its templates
pub fn claim_names_for_pod(sts: &StatefulSet, pod_name: &str) -> Vec<String> {
    sts.spec
        .as_ref()
        .and_then(|s| s.volume_claim_templates.as_ref())
        .map(|templates| {
            templates
                .iter()
                .map(|t| format!("{}-{}", t.name_any(), pod_name))
                .collect()
        })
        .unwrap_or_default()
}

fn namespace_of(sts: &StatefulSet) -> String {
    sts.namespace().unwrap_or_default()
}

/// Create a StatefulSet
pub async fn create_statefulset(client: &Client, sts: &StatefulSet) -> Result<StatefulSet> {
    let namespace = namespace_of(sts);
    let api: Api<StatefulSet> = Api::namespaced(client.clone(), &namespace);
    let created = api.create(&PostParams::default(), sts).await?;
    info!(
        namespace = %namespace,
        statefulset = %created.name_any(),
        replicas = desired_replicas(&created),
        "Created StatefulSet"
    );
    Ok(created)
}

/// Create a StatefulSet and wait until all its pods are running and ready
pub async fn create_and_wait(
    client: &Client,
    sts: &StatefulSet,
    poller: &Poller,
) -> Result<StatefulSet> {
    let created = create_statefulset(client, sts).await?;
    wait_for_pods_running_ready(client, &created, desired_replicas(&created), poller).await?;
    Ok(created)
}

/// Create every StatefulSet concurrently and wait for each to have
/// `replicas` running and ready pods.
///
/// Every task runs to completion; all failures are reported together.
pub async fn create_statefulsets_in_parallel(
    client: &Client,
    statefulsets: Vec<StatefulSet>,
    replicas: i32,
    poller: &Poller,
) -> Result<Vec<StatefulSet>> {
    let tasks = statefulsets
        .into_iter()
        .map(|sts| {
            let client = client.clone();
            let poller = poller.clone();
            let label = sts.name_any();
            let fut = async move {
                let created = create_statefulset(&client, &sts).await?;
                wait_for_pods_running_ready(&client, &created, replicas, &poller).await?;
                Ok::<_, Error>(created)
            };
            (label, fut)
        })
        .collect();
    fanout::run_all(tasks).await
}

/// Pods owned by a StatefulSet, sorted by ordinal
pub async fn statefulset_pods(client: &Client, sts: &StatefulSet) -> Result<Vec<Pod>> {
    let namespace = namespace_of(sts);
    let name = sts.name_any();
    let selector = sts
        .spec
        .as_ref()
        .and_then(|s| s.selector.match_labels.as_ref())
        .map(label_selector)
        .unwrap_or_default();

    let api: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    let mut pods: Vec<Pod> = api
        .list(&ListParams::default().labels(&selector))
        .await?
        .items
        .into_iter()
        .filter(|pod| {
            pod.owner_references()
                .iter()
                .any(|owner| owner.kind == "StatefulSet" && owner.name == name)
        })
        .collect();
    pods.sort_by_key(|pod| pod_ordinal(&pod.name_any()));
    Ok(pods)
}

/// Check a pod list against the expected ready count.
///
/// `Ok(true)` when exactly `expected` pods exist, every pod is Running,
/// and a pod is Ready exactly when its ordinal is below `expected`. More
/// pods than `expected` is an error.
pub fn pods_running_ready(pods: &[Pod], expected: i32) -> Result<bool> {
    let count = i32::try_from(pods.len()).unwrap_or(i32::MAX);
    if count > expected {
        return Err(Error::Assertion(format!(
            "too many pods: expected {}, found {}",
            expected, count
        )));
    }
    if count < expected {
        return Ok(false);
    }
    for pod in pods {
        if !is_pod_running(pod) {
            debug!(pod = %pod.name_any(), "Pod not running yet");
            return Ok(false);
        }
        let should_be_ready = pod_ordinal(&pod.name_any()) < expected;
        if is_pod_ready(pod) != should_be_ready {
            debug!(pod = %pod.name_any(), should_be_ready, "Pod readiness not settled");
            return Ok(false);
        }
    }
    Ok(true)
}

/// Wait for `expected` pods of the StatefulSet to be Running and Ready
pub async fn wait_for_pods_running_ready(
    client: &Client,
    sts: &StatefulSet,
    expected: i32,
    poller: &Poller,
) -> Result<()> {
    poller
        .describe(format!(
            "{} pods of StatefulSet {}/{} running and ready",
            expected,
            namespace_of(sts),
            sts.name_any()
        ))
        .poll_immediate(|| async {
            let pods = statefulset_pods(client, sts).await?;
            pods_running_ready(&pods, expected)
        })
        .await
}

/// Wait until the StatefulSet status reports `replicas` ready replicas
pub async fn wait_for_ready_replicas(
    client: &Client,
    namespace: &str,
    name: &str,
    replicas: i32,
    poller: &Poller,
) -> Result<()> {
    let api: Api<StatefulSet> = Api::namespaced(client.clone(), namespace);
    poller
        .describe(format!(
            "StatefulSet {}/{} with {} ready replicas",
            namespace, name, replicas
        ))
        .poll_immediate(|| async {
            let sts = api.get(name).await?;
            let observed = sts.status.as_ref().and_then(|s| s.observed_generation);
            let generation = sts.metadata.generation;
            let status = sts.status.unwrap_or_default();
            Ok(observed >= generation
                && status.replicas == replicas
                && status.ready_replicas.unwrap_or(0) == replicas)
        })
        .await
}

/// Set the replica count of a StatefulSet
pub async fn scale_statefulset(
    client: &Client,
    namespace: &str,
    name: &str,
    replicas: i32,
) -> Result<StatefulSet> {
    let api: Api<StatefulSet> = Api::namespaced(client.clone(), namespace);
    let patch = json!({ "spec": { "replicas": replicas } });
    let sts = api
        .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    info!(namespace = %namespace, statefulset = %name, replicas, "Scaled StatefulSet");
    Ok(sts)
}

/// Scale up and verify each pod's claims are Bound and attached to its node
pub async fn scale_up(
    client: &Client,
    sts: &StatefulSet,
    replicas: i32,
    poller: &Poller,
) -> Result<Vec<Pod>> {
    let namespace = namespace_of(sts);
    let name = sts.name_any();
    scale_statefulset(client, &namespace, &name, replicas).await?;
    wait_for_ready_replicas(client, &namespace, &name, replicas, poller).await?;

    let pods = statefulset_pods(client, sts).await?;
    if i32::try_from(pods.len()).unwrap_or(i32::MAX) != replicas {
        return Err(Error::Assertion(format!(
            "StatefulSet {}/{} has {} pods after scaling to {}",
            namespace,
            name,
            pods.len(),
            replicas
        )));
    }

    for pod in &pods {
        let pod_name = pod.name_any();
        let node = pod_node_name(pod).ok_or_else(|| {
            Error::Assertion(format!("pod {}/{} is not scheduled", namespace, pod_name))
        })?;
        for claim in claim_names_for_pod(sts, &pod_name) {
            let pv = pvc::pv_for_claim(client, &namespace, &claim).await?;
            let pv_name = pv.name_any();
            poller
                .describe(format!("volume {} attached to {}", pv_name, node))
                .poll_immediate(|| attachment::is_volume_attached(client, &pv_name, node))
                .await?;
        }
    }
    Ok(pods)
}

/// Scale down and verify the removed pods' volumes detach from their nodes
pub async fn scale_down(
    client: &Client,
    sts: &StatefulSet,
    replicas: i32,
    poller: &Poller,
) -> Result<Vec<Pod>> {
    let namespace = namespace_of(sts);
    let name = sts.name_any();
    let before = statefulset_pods(client, sts).await?;

    scale_statefulset(client, &namespace, &name, replicas).await?;
    wait_for_ready_replicas(client, &namespace, &name, replicas, poller).await?;

    let after = statefulset_pods(client, sts).await?;
    if i32::try_from(after.len()).unwrap_or(i32::MAX) != replicas {
        return Err(Error::Assertion(format!(
            "StatefulSet {}/{} has {} pods after scaling to {}",
            namespace,
            name,
            after.len(),
            replicas
        )));
    }

    for pod in before
        .iter()
        .filter(|pod| pod_ordinal(&pod.name_any()) >= replicas)
    {
        let Some(node) = pod_node_name(pod) else {
            continue;
        };
        for claim in claim_names_for_pod(sts, &pod.name_any()) {
            let pv = pvc::pv_for_claim(client, &namespace, &claim).await?;
            attachment::wait_for_volume_detached(client, &pv.name_any(), node, poller).await?;
        }
    }
    Ok(after)
}

/// Verify every pod of the StatefulSet sees `mount_path` in its mount table
pub async fn check_mount(client: &Client, sts: &StatefulSet, mount_path: &str) -> Result<()> {
    let namespace = namespace_of(sts);
    for pod in statefulset_pods(client, sts).await? {
        let pod_name = pod.name_any();
        let output = exec_in_pod(client, &namespace, &pod_name, &["/bin/sh", "-c", "mount"]).await?;
        if !output.lines().any(|line| line.contains(mount_path)) {
            return Err(Error::Assertion(format!(
                "{} is not mounted in pod {}/{}",
                mount_path, namespace, pod_name
            )));
        }
        debug!(pod = %pod_name, mount_path = %mount_path, "Mount present");
    }
    Ok(())
}

/// List with retries, recording a failure in `errors` instead of returning it
async fn list_or_record<T, F, Fut>(
    poller: &Poller,
    what: &str,
    errors: &mut Vec<String>,
    mut list: F,
) -> Vec<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<T>>>,
{
    let listed = poller
        .describe(format!("list {}", what))
        .poll_value_ignoring_errors(|| {
            let fut = list();
            async move { fut.await.map(Some) }
        })
        .await;
    match listed {
        Ok(items) => items,
        Err(e) => {
            warn!(what = %what, error = %e, "Giving up on listing");
            errors.push(format!("list {}: {}", what, e));
            Vec::new()
        }
    }
}

/// Delete every StatefulSet in the namespace along with its volumes.
///
/// Each StatefulSet is scaled to zero and deleted, then every claim in the
/// namespace is deleted and the provisioner is given time to remove the
/// bound volumes. Listing is retried, and a step whose listing never
/// succeeds is skipped so the remaining steps still run. All errors are
/// collected and returned together.
pub async fn delete_all_statefulsets(
    client: &Client,
    namespace: &str,
    poller: &Poller,
) -> Result<()> {
    let mut errors = Vec::new();
    let sts_api: Api<StatefulSet> = Api::namespaced(client.clone(), namespace);

    let statefulsets = list_or_record(poller, "StatefulSets", &mut errors, || async {
        Ok::<_, Error>(sts_api.list(&ListParams::default()).await?.items)
    })
    .await;
    for sts in &statefulsets {
        let name = sts.name_any();
        if let Err(e) = scale_statefulset(client, namespace, &name, 0).await {
            warn!(statefulset = %name, error = %e, "Failed to scale down before delete");
            errors.push(format!("scale {} to 0: {}", name, e));
        }
        if let Err(e) = wait_for_ready_replicas(client, namespace, &name, 0, poller).await {
            errors.push(format!("wait for {} to scale to 0: {}", name, e));
        }
        if let Err(e) = delete_if_exists(&sts_api, &name, &immediate_delete()).await {
            errors.push(format!("delete StatefulSet {}: {}", name, e));
        }
    }

    let claims = list_or_record(poller, "claims", &mut errors, || {
        pvc::list_claims(client, namespace)
    })
    .await;
    let mut volumes = Vec::new();
    for claim in &claims {
        let claim_name = claim.name_any();
        if let Some(volume) = claim.spec.as_ref().and_then(|s| s.volume_name.clone()) {
            volumes.push(volume);
        }
        if let Err(e) = pvc::delete_pvc(client, namespace, &claim_name).await {
            errors.push(format!("delete claim {}: {}", claim_name, e));
        }
    }

    for volume in &volumes {
        if let Err(e) = pvc::wait_for_pv_deleted(client, volume, poller).await {
            errors.push(format!("volume {} not removed: {}", volume, e));
        }
    }

    info!(
        namespace = %namespace,
        statefulsets = statefulsets.len(),
        claims = claims.len(),
        errors = errors.len(),
        "Deleted StatefulSets"
    );
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Multiple(errors))
    }
}
