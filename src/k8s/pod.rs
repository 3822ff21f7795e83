//! Standalone pods: builder, readiness checks, exec.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaimVolumeSource, Pod, PodSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, AttachParams, DeleteParams, PostParams};
use kube::{Client, ResourceExt};
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::k8s::common::{delete_if_exists, standard_labels};
use crate::poll::Poller;

/// Mount root for claims attached to a standalone pod
pub const POD_MOUNT_ROOT: &str = "/mnt/volume";

/// Keeps the container alive so volumes stay attached
const SLEEP_FOREVER: &str = "while true ; do sleep 2 ; done";

/// Builder for a busybox pod mounting one or more claims
#[derive(Clone, Debug)]
pub struct PodBuilder {
    namespace: String,
    generate_name: String,
    image: String,
    claims: Vec<String>,
    node_selector: BTreeMap<String, String>,
    command: String,
}

impl PodBuilder {
    /// Create a builder for a pod in `namespace`
    pub fn new(namespace: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            generate_name: "pvc-tester-".to_string(),
            image: image.into(),
            claims: Vec::new(),
            node_selector: BTreeMap::new(),
            command: SLEEP_FOREVER.to_string(),
        }
    }

    /// Mount a claim at `/mnt/volume<N>` (1-based, in call order)
    pub fn claim(mut self, claim_name: impl Into<String>) -> Self {
        self.claims.push(claim_name.into());
        self
    }

    /// Pin the pod with a node selector entry
    pub fn node_selector(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.node_selector.insert(key.into(), value.into());
        self
    }

    /// Override the shell command run by the container
    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    pub fn build(self) -> Pod {
        let volumes: Vec<Volume> = self
            .claims
            .iter()
            .enumerate()
            .map(|(i, claim)| Volume {
                name: format!("volume{}", i + 1),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim.clone(),
                    read_only: Some(false),
                }),
                ..Default::default()
            })
            .collect();
        let mounts: Vec<VolumeMount> = volumes
            .iter()
            .enumerate()
            .map(|(i, v)| VolumeMount {
                name: v.name.clone(),
                mount_path: format!("{}{}", POD_MOUNT_ROOT, i + 1),
                ..Default::default()
            })
            .collect();

        Pod {
            metadata: ObjectMeta {
                generate_name: Some(self.generate_name),
                namespace: Some(self.namespace),
                labels: Some(standard_labels("pvc-tester")),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "write-pod".to_string(),
                    image: Some(self.image),
                    command: Some(vec!["/bin/sh".to_string()]),
                    args: Some(vec!["-c".to_string(), self.command]),
                    volume_mounts: Some(mounts),
                    ..Default::default()
                }],
                volumes: Some(volumes),
                node_selector: if self.node_selector.is_empty() {
                    None
                } else {
                    Some(self.node_selector)
                },
                restart_policy: Some("OnFailure".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Whether the pod reports the `Ready` condition as `True`
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Whether the pod is in the `Running` phase
pub fn is_pod_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == "Running")
}

/// Name of the node the pod is scheduled on
pub fn pod_node_name(pod: &Pod) -> Option<&str> {
    pod.spec.as_ref().and_then(|s| s.node_name.as_deref())
}

/// Create a pod and return the server's copy (with its generated name)
pub async fn create_pod(client: &Client, pod: &Pod) -> Result<Pod> {
    let namespace = pod.namespace().unwrap_or_default();
    let api: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    let created = api.create(&PostParams::default(), pod).await?;
    info!(namespace = %namespace, pod = %created.name_any(), "Created pod");
    Ok(created)
}

/// Wait until the pod is Running and Ready
pub async fn wait_for_pod_running(
    client: &Client,
    namespace: &str,
    name: &str,
    poller: &Poller,
) -> Result<Pod> {
    let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    poller
        .describe(format!("pod {}/{} running and ready", namespace, name))
        .poll_value(|| async {
            let pod = match api.get(name).await {
                Ok(pod) => pod,
                Err(e) => {
                    debug!(pod = %name, error = %e, "Pod not readable yet");
                    return Ok(None);
                }
            };
            if pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Failed") {
                return Err(Error::Assertion(format!("pod {}/{} failed", namespace, name)));
            }
            Ok((is_pod_running(&pod) && is_pod_ready(&pod)).then_some(pod))
        })
        .await
}

/// Delete a pod and wait until it is gone
pub async fn delete_pod_and_wait(
    client: &Client,
    namespace: &str,
    name: &str,
    poller: &Poller,
) -> Result<()> {
    let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    if !delete_if_exists(&api, name, &DeleteParams::default()).await? {
        return Ok(());
    }
    poller
        .describe(format!("pod {}/{} deleted", namespace, name))
        .poll_immediate(|| async {
            match api.get_opt(name).await? {
                Some(_) => Ok(false),
                None => Ok(true),
            }
        })
        .await
}

/// Run a command in the pod's first container and return its stdout.
///
/// A non-success exit status is an [`Error::Command`] carrying stderr.
pub async fn exec_in_pod(
    client: &Client,
    namespace: &str,
    pod: &str,
    command: &[&str],
) -> Result<String> {
    let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let params = AttachParams::default().stdout(true).stderr(true);
    let mut attached = api.exec(pod, command.to_vec(), &params).await?;

    let stdout_reader = attached.stdout();
    let stderr_reader = attached.stderr();
    let read_stdout = async {
        let mut buf = String::new();
        if let Some(mut reader) = stdout_reader {
            reader.read_to_string(&mut buf).await?;
        }
        Ok::<_, std::io::Error>(buf)
    };
    let read_stderr = async {
        let mut buf = String::new();
        if let Some(mut reader) = stderr_reader {
            reader.read_to_string(&mut buf).await?;
        }
        Ok::<_, std::io::Error>(buf)
    };
    let (stdout, stderr) = tokio::try_join!(read_stdout, read_stderr)?;

    let status = match attached.take_status() {
        Some(status) => status.await,
        None => None,
    };
    attached
        .join()
        .await
        .map_err(|e| Error::Command(format!("exec in {}/{}: {}", namespace, pod, e)))?;

    match status.as_ref().and_then(|s| s.status.as_deref()) {
        Some("Success") | None => Ok(stdout),
        Some(_) => Err(Error::Command(format!(
            "{:?} in {}/{} failed: {}{}",
            command,
            namespace,
            pod,
            stderr.trim(),
            status
                .and_then(|s| s.message)
                .map(|m| format!(" ({})", m))
                .unwrap_or_default()
        ))),
    }
}
