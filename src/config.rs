//! Suite configuration loaded from environment variables.
//!
//! Everything is read once per test into an [`E2eConfig`]. Parsing goes
//! through a key lookup so it can be exercised without touching the process
//! environment.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::topology::TopologyMap;

pub const ENV_TOPOLOGY_MAP: &str = "TOPOLOGY_MAP";
pub const ENV_TOPOLOGY_CLUSTERS: &str = "TOPOLOGY_CLUSTERS";
pub const ENV_STORAGE_POLICY_SHARED: &str = "STORAGE_POLICY_FOR_SHARED_DATASTORES";
pub const ENV_TESTBED_INFO_JSON: &str = "TESTBEDINFO_JSON";
pub const ENV_VCENTER_HOST: &str = "VCENTER_HOST";
pub const ENV_VCENTER_USERNAME: &str = "VCENTER_USERNAME";
pub const ENV_VCENTER_PASSWORD: &str = "VCENTER_PASSWORD";
pub const ENV_VCENTER_INSECURE: &str = "VCENTER_INSECURE";
pub const ENV_SSH_USER: &str = "SSH_USER";
pub const ENV_SSH_IDENTITY_FILE: &str = "SSH_IDENTITY_FILE";
pub const ENV_STATEFULSET_IMAGE: &str = "STATEFULSET_IMAGE";
pub const ENV_BUSYBOX_IMAGE: &str = "BUSYBOX_IMAGE";
pub const ENV_POLL_INTERVAL_SECS: &str = "E2E_POLL_INTERVAL_SECS";

pub const DEFAULT_STATEFULSET_IMAGE: &str = "registry.k8s.io/nginx-slim:0.26";
pub const DEFAULT_BUSYBOX_IMAGE: &str = "busybox:1.36";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;

/// vCenter REST credentials
#[derive(Clone)]
pub struct VcenterCredentials {
    pub host: String,
    pub username: String,
    pub password: String,
    pub insecure: bool,
}

impl std::fmt::Debug for VcenterCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VcenterCredentials")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("insecure", &self.insecure)
            .finish()
    }
}

/// Configuration for one run of the suite
#[derive(Clone, Debug)]
pub struct E2eConfig {
    pub topology: Option<TopologyMap>,
    pub topology_clusters: Vec<String>,
    pub storage_policy: Option<String>,
    pub testbed_info_path: Option<PathBuf>,
    pub vcenter: Option<VcenterCredentials>,
    pub ssh_user: String,
    pub ssh_identity_file: Option<PathBuf>,
    pub statefulset_image: String,
    pub busybox_image: String,
    pub poll_interval: Duration,
}

impl E2eConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let topology = get(ENV_TOPOLOGY_MAP)
            .map(|raw| TopologyMap::parse(&raw))
            .transpose()?;

        let topology_clusters = get(ENV_TOPOLOGY_CLUSTERS)
            .map(|raw| split_list(&raw))
            .unwrap_or_default();

        let vcenter = match (
            get(ENV_VCENTER_HOST),
            get(ENV_VCENTER_USERNAME),
            get(ENV_VCENTER_PASSWORD),
        ) {
            (Some(host), Some(username), Some(password)) => Some(VcenterCredentials {
                host,
                username,
                password,
                insecure: parse_bool(ENV_VCENTER_INSECURE, get(ENV_VCENTER_INSECURE), true)?,
            }),
            (None, None, None) => None,
            _ => {
                return Err(Error::Config(format!(
                    "{}, {} and {} must be set together",
                    ENV_VCENTER_HOST, ENV_VCENTER_USERNAME, ENV_VCENTER_PASSWORD
                )));
            }
        };

        let poll_interval = match get(ENV_POLL_INTERVAL_SECS) {
            Some(raw) => {
                let secs: u64 = raw.trim().parse().map_err(|_| {
                    Error::Config(format!(
                        "{} must be a whole number of seconds, got {:?}",
                        ENV_POLL_INTERVAL_SECS, raw
                    ))
                })?;
                if secs == 0 {
                    return Err(Error::Config(format!(
                        "{} must be greater than zero",
                        ENV_POLL_INTERVAL_SECS
                    )));
                }
                Duration::from_secs(secs)
            }
            None => Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
        };

        Ok(Self {
            topology,
            topology_clusters,
            storage_policy: get(ENV_STORAGE_POLICY_SHARED),
            testbed_info_path: get(ENV_TESTBED_INFO_JSON).map(PathBuf::from),
            vcenter,
            ssh_user: get(ENV_SSH_USER).unwrap_or_else(|| "root".to_string()),
            ssh_identity_file: get(ENV_SSH_IDENTITY_FILE).map(PathBuf::from),
            statefulset_image: get(ENV_STATEFULSET_IMAGE)
                .unwrap_or_else(|| DEFAULT_STATEFULSET_IMAGE.to_string()),
            busybox_image: get(ENV_BUSYBOX_IMAGE)
                .unwrap_or_else(|| DEFAULT_BUSYBOX_IMAGE.to_string()),
            poll_interval,
        })
    }

    /// Topology map, required by the topology suites
    pub fn require_topology(&self) -> Result<&TopologyMap> {
        self.topology
            .as_ref()
            .ok_or_else(|| missing(ENV_TOPOLOGY_MAP))
    }

    /// vCenter credentials, required by the power and service suites
    pub fn require_vcenter(&self) -> Result<&VcenterCredentials> {
        self.vcenter.as_ref().ok_or_else(|| missing(ENV_VCENTER_HOST))
    }

    /// Storage policy name for shared datastores
    pub fn require_storage_policy(&self) -> Result<&str> {
        self.storage_policy
            .as_deref()
            .ok_or_else(|| missing(ENV_STORAGE_POLICY_SHARED))
    }

    /// Cluster name backing the zone at `index` in `TOPOLOGY_CLUSTERS`
    pub fn topology_cluster(&self, index: usize) -> Result<&str> {
        self.topology_clusters
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| {
                Error::Config(format!(
                    "{} lists {} clusters, scenario needs index {}",
                    ENV_TOPOLOGY_CLUSTERS,
                    self.topology_clusters.len(),
                    index
                ))
            })
    }
}

fn missing(name: &str) -> Error {
    Error::Config(format!("environment variable {} is not set", name))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(key: &str, value: Option<String>, default: bool) -> Result<bool> {
    match value.as_deref().map(str::trim) {
        None => Ok(default),
        Some(v) if v.eq_ignore_ascii_case("true") || v == "1" => Ok(true),
        Some(v) if v.eq_ignore_ascii_case("false") || v == "0" => Ok(false),
        Some(v) => Err(Error::Config(format!(
            "{} must be true or false, got {:?}",
            key, v
        ))),
    }
}
