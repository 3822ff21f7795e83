//! Shared test cluster singleton.
//!
//! Provides the Kubernetes connection and run configuration for all
//! integration tests. Each test creates its own Client from the shared
//! cluster for isolation.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use kube::{Client, Config};
use tokio::sync::OnceCell;
use vsphere_csi_e2e::k8s::nodes::ready_schedulable_nodes;
use vsphere_csi_e2e::{E2eConfig, TestbedInfo, VsphereClient};

/// Global shared test cluster instance.
static SHARED_CLUSTER: OnceCell<Arc<SharedTestCluster>> = OnceCell::const_new();

/// Shared test cluster providing Kubernetes connectivity and configuration.
///
/// Connectivity and configuration are validated once; later calls return
/// the cached instance.
pub struct SharedTestCluster {
    config: E2eConfig,
}

impl SharedTestCluster {
    /// Get or create the shared test cluster.
    ///
    /// Safe to call from multiple tests concurrently.
    pub async fn get() -> Arc<SharedTestCluster> {
        SHARED_CLUSTER
            .get_or_init(|| async {
                let cluster = Self::connect().await.unwrap_or_else(|e| {
                    panic!("Failed to connect to Kubernetes cluster. Is your kubeconfig configured? {e}")
                });
                Arc::new(cluster)
            })
            .await
            .clone()
    }

    /// Create a new Kubernetes client.
    pub async fn new_client(&self) -> Client {
        let config = Config::infer().await.expect("Failed to infer kube config");
        Client::try_from(config).expect("Failed to create kube client")
    }

    /// Configuration read from the environment at first use
    pub fn config(&self) -> &E2eConfig {
        &self.config
    }

    /// Ready, schedulable nodes; panics when there are none
    pub async fn ready_nodes(&self) -> Vec<Node> {
        let client = self.new_client().await;
        let nodes = ready_schedulable_nodes(&client)
            .await
            .expect("Failed to list nodes");
        assert!(!nodes.is_empty(), "cluster has no ready schedulable nodes");
        nodes
    }

    /// Log into vCenter with the configured credentials
    pub async fn vsphere(&self) -> VsphereClient {
        let credentials = self
            .config
            .require_vcenter()
            .expect("vCenter credentials required");
        VsphereClient::connect(credentials.clone())
            .await
            .expect("Failed to log into vCenter")
    }

    /// Testbed layout from `TESTBEDINFO_JSON`
    pub async fn testbed(&self) -> TestbedInfo {
        let path = self
            .config
            .testbed_info_path
            .as_ref()
            .expect("TESTBEDINFO_JSON must be set for host power scenarios");
        TestbedInfo::load(path)
            .await
            .expect("Failed to load testbed info")
    }

    async fn connect() -> Result<Self, Box<dyn std::error::Error>> {
        let config = E2eConfig::from_env()?;
        let client = Client::try_from(Config::infer().await?)?;

        // Quick health check
        let version = client.apiserver_version().await?;
        tracing::info!(
            platform = %version.platform,
            version = %version.git_version,
            "Connected to Kubernetes cluster"
        );

        Ok(Self { config })
    }
}
