//! Idempotent power helpers for VMs and nested ESXi hosts.
//!
//! Hosts are nested: powering a host off means powering off the VM that
//! backs it, then waiting for vCenter to lose the connection.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::k8s::nodes::node_vm_uuid;
use crate::poll::Poller;
use crate::testbed::TestbedInfo;
use crate::vsphere::{ConnectionState, Hypervisor, PowerState, VmSummary};

/// Outcome of an idempotent power request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerChange {
    /// Already in the requested state; nothing was sent
    AlreadyInState,
    /// A power operation was issued and the new state observed
    Changed,
}

async fn set_power<H: Hypervisor>(
    hypervisor: &H,
    vm: &str,
    target: PowerState,
    poller: &Poller,
) -> Result<PowerChange> {
    let current = hypervisor.vm_power_state(vm).await?;
    if current == target {
        info!(vm = %vm, state = %target, "VM already in requested power state");
        return Ok(PowerChange::AlreadyInState);
    }

    hypervisor.set_vm_power(vm, target).await?;
    poller
        .describe(format!("VM {} to reach {}", vm, target))
        .poll_immediate(|| async { Ok(hypervisor.vm_power_state(vm).await? == target) })
        .await?;
    info!(vm = %vm, from = %current, to = %target, "VM power state changed");
    Ok(PowerChange::Changed)
}

/// Power a VM on unless it already is
pub async fn power_on_vm<H: Hypervisor>(
    hypervisor: &H,
    vm: &str,
    poller: &Poller,
) -> Result<PowerChange> {
    set_power(hypervisor, vm, PowerState::PoweredOn, poller).await
}

/// Power a VM off unless it already is
pub async fn power_off_vm<H: Hypervisor>(
    hypervisor: &H,
    vm: &str,
    poller: &Poller,
) -> Result<PowerChange> {
    set_power(hypervisor, vm, PowerState::PoweredOff, poller).await
}

async fn vm_named<H: Hypervisor>(hypervisor: &H, name: &str) -> Result<VmSummary> {
    hypervisor
        .vm_by_name(name)
        .await?
        .ok_or_else(|| Error::Vsphere {
            status: 404,
            message: format!("VM {} not found", name),
        })
}

async fn wait_for_host_connection<H: Hypervisor>(
    hypervisor: &H,
    host: &str,
    connected: bool,
    poller: &Poller,
) -> Result<()> {
    let wanted = if connected { "connected" } else { "disconnected" };
    poller
        .describe(format!("host {} {}", host, wanted))
        .poll_ignoring_errors(|| async {
            let state = hypervisor
                .host_by_name(host)
                .await?
                .map(|h| h.connection_state);
            Ok((state == Some(ConnectionState::Connected)) == connected)
        })
        .await
}

/// Power off the first `count` connected hosts of `cluster`.
///
/// Returns the backing VM names of the hosts taken down, in the order they
/// were powered off.
pub async fn power_off_hosts_in_cluster<H: Hypervisor>(
    hypervisor: &H,
    testbed: &TestbedInfo,
    cluster: &str,
    count: usize,
    poller: &Poller,
) -> Result<Vec<String>> {
    let connected: Vec<_> = hypervisor
        .cluster_hosts(cluster)
        .await?
        .into_iter()
        .filter(|h| h.is_connected())
        .collect();
    if connected.len() < count {
        return Err(Error::Assertion(format!(
            "cluster {} has {} connected hosts, cannot power off {}",
            cluster,
            connected.len(),
            count
        )));
    }

    let mut powered_off = Vec::with_capacity(count);
    for host in connected.iter().take(count) {
        let esx = testbed.host_by_ip(&host.name).ok_or_else(|| {
            Error::Config(format!("host {} is not listed in the testbed info", host.name))
        })?;
        let vm = vm_named(hypervisor, &esx.vm_name).await?;
        power_off_vm(hypervisor, &vm.vm, poller).await?;
        wait_for_host_connection(hypervisor, &host.name, false, poller).await?;
        info!(cluster = %cluster, host = %host.name, vm = %esx.vm_name, "Host powered off");
        powered_off.push(esx.vm_name.clone());
    }
    Ok(powered_off)
}

/// Power on the host backed by `host_vm_name` and wait for it to reconnect
pub async fn power_on_host<H: Hypervisor>(
    hypervisor: &H,
    testbed: &TestbedInfo,
    host_vm_name: &str,
    poller: &Poller,
) -> Result<PowerChange> {
    let esx = testbed.host_by_vm_name(host_vm_name).ok_or_else(|| {
        Error::Config(format!("no testbed host is backed by VM {}", host_vm_name))
    })?;
    let vm = vm_named(hypervisor, host_vm_name).await?;
    let change = power_on_vm(hypervisor, &vm.vm, poller).await?;
    wait_for_host_connection(hypervisor, &esx.ip, true, poller).await?;
    info!(host = %esx.ip, vm = %host_vm_name, ?change, "Host powered on");
    Ok(change)
}

/// Power on the VM behind a cluster node (located by its provider id)
pub async fn power_on_node<H: Hypervisor>(
    hypervisor: &H,
    node: &Node,
    poller: &Poller,
) -> Result<PowerChange> {
    let uuid = node_vm_uuid(node).ok_or_else(|| {
        Error::Assertion(format!("node {} has no vSphere provider id", node.name_any()))
    })?;
    let vm = hypervisor
        .vm_by_instance_uuid(&uuid)
        .await?
        .ok_or_else(|| Error::Vsphere {
            status: 404,
            message: format!("no VM with instance UUID {}", uuid),
        })?;
    power_on_vm(hypervisor, &vm.vm, poller).await
}

/// Hosts taken down for an outage scenario.
///
/// Call [`HostOutage::restore`] to power them back on. If the guard is
/// dropped first (a failed assertion), the hosts are powered on from a
/// blocking section, which needs the multi-thread runtime.
pub struct HostOutage<H: Hypervisor + 'static> {
    hypervisor: Arc<H>,
    testbed: TestbedInfo,
    poller: Poller,
    hosts: Vec<String>,
}

impl<H: Hypervisor + 'static> HostOutage<H> {
    /// Power off `count` hosts of `cluster` and track them
    pub async fn power_off(
        hypervisor: Arc<H>,
        testbed: TestbedInfo,
        cluster: &str,
        count: usize,
        poller: Poller,
    ) -> Result<Self> {
        let hosts =
            power_off_hosts_in_cluster(hypervisor.as_ref(), &testbed, cluster, count, &poller)
                .await?;
        Ok(Self {
            hypervisor,
            testbed,
            poller,
            hosts,
        })
    }

    /// Merge another outage into this one so both are restored together
    pub fn absorb(&mut self, mut other: HostOutage<H>) {
        self.hosts.append(&mut other.hosts);
    }

    /// Backing VM names of the hosts currently down
    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    /// Power every tracked host back on; all failures are reported together
    pub async fn restore(mut self) -> Result<()> {
        let hosts = std::mem::take(&mut self.hosts);
        restore_hosts(self.hypervisor.as_ref(), &self.testbed, &hosts, &self.poller).await
    }
}

async fn restore_hosts<H: Hypervisor>(
    hypervisor: &H,
    testbed: &TestbedInfo,
    hosts: &[String],
    poller: &Poller,
) -> Result<()> {
    let mut errors = Vec::new();
    for host in hosts {
        if let Err(e) = power_on_host(hypervisor, testbed, host, poller).await {
            warn!(host = %host, error = %e, "Failed to power host back on");
            errors.push(format!("{}: {}", host, e));
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Multiple(errors))
    }
}

impl<H: Hypervisor + 'static> Drop for HostOutage<H> {
    fn drop(&mut self) {
        if self.hosts.is_empty() {
            return;
        }
        let hosts = std::mem::take(&mut self.hosts);
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(hosts = ?hosts, "No runtime to restore hosts, leaving them powered off");
            return;
        };
        warn!(hosts = ?hosts, "Host outage dropped without restore, powering hosts on");
        let hypervisor = self.hypervisor.clone();
        let testbed = self.testbed.clone();
        let poller = self.poller.clone();
        tokio::task::block_in_place(|| {
            handle.block_on(async {
                if let Err(e) = restore_hosts(hypervisor.as_ref(), &testbed, &hosts, &poller).await
                {
                    warn!(error = %e, "Drop: host restore incomplete");
                }
            });
        });
    }
}
