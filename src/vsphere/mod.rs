//! vSphere control plane access.
//!
//! [`Hypervisor`] is the seam between the power helpers and vCenter: the
//! suite runs them against [`VsphereClient`] while the functional tests use
//! an in-memory implementation.

pub mod power;
pub mod rest;
pub mod services;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use power::{HostOutage, PowerChange, power_off_vm, power_on_vm};
pub use rest::VsphereClient;

/// Power state of a virtual machine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PoweredOn => "POWERED_ON",
            Self::PoweredOff => "POWERED_OFF",
            Self::Suspended => "SUSPENDED",
        };
        f.write_str(s)
    }
}

/// Connection state of an ESXi host as seen by vCenter
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Connected,
    Disconnected,
    NotResponding,
}

/// Host entry from the vCenter inventory.
///
/// Nested testbeds register hosts by IP address, so `name` is usually the
/// host's IP.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSummary {
    pub host: String,
    pub name: String,
    pub connection_state: ConnectionState,
    /// Only reported while the host is connected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_state: Option<String>,
}

impl HostSummary {
    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }
}

/// VM entry from the vCenter inventory
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSummary {
    pub vm: String,
    pub name: String,
    pub power_state: PowerState,
}

/// Inventory and power operations the suite needs from the virtualization
/// layer. VM arguments are inventory identifiers (`vm-42`).
pub trait Hypervisor: Send + Sync {
    /// Hosts of the named compute cluster
    fn cluster_hosts(
        &self,
        cluster: &str,
    ) -> impl std::future::Future<Output = Result<Vec<HostSummary>>> + Send;

    /// Look a host up by its inventory name
    fn host_by_name(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<HostSummary>>> + Send;

    /// Look a VM up by its display name
    fn vm_by_name(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<VmSummary>>> + Send;

    /// Look a VM up by its instance UUID (the node's provider id)
    fn vm_by_instance_uuid(
        &self,
        uuid: &str,
    ) -> impl std::future::Future<Output = Result<Option<VmSummary>>> + Send;

    /// Current power state of a VM
    fn vm_power_state(&self, vm: &str)
    -> impl std::future::Future<Output = Result<PowerState>> + Send;

    /// Request a power state change.
    ///
    /// This is the raw operation: it may fail when the VM is already in the
    /// requested state. Use [`power_on_vm`] / [`power_off_vm`] for the
    /// idempotent form.
    fn set_vm_power(
        &self,
        vm: &str,
        state: PowerState,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}
