//! In-memory hypervisor for exercising the power helpers without vCenter.
//!
//! Models a nested testbed: every ESXi host is backed by a VM, and a host
//! reports `CONNECTED` exactly when its backing VM is powered on. Like the
//! real API, a power request for a VM already in that state is rejected.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use vsphere_csi_e2e::testbed::TestbedInfo;
use vsphere_csi_e2e::vsphere::{ConnectionState, HostSummary, Hypervisor, PowerState, VmSummary};
use vsphere_csi_e2e::{Error, Result};

#[derive(Debug, Clone)]
struct MockVm {
    id: String,
    name: String,
    instance_uuid: String,
    state: PowerState,
    /// Reads left before a requested state becomes visible
    pending: Option<(PowerState, u32)>,
}

#[derive(Debug, Default)]
struct Inner {
    vms: Vec<MockVm>,
    /// cluster name -> host IPs
    clusters: BTreeMap<String, Vec<String>>,
    /// host IP -> backing VM name
    host_vms: BTreeMap<String, String>,
    power_requests: Vec<(String, PowerState)>,
}

/// Mock implementation of [`Hypervisor`]
#[derive(Debug, Default)]
pub struct MockHypervisor {
    inner: Mutex<Inner>,
    /// Number of state reads before a power change is observed
    transition_reads: AtomicU32,
}

impl MockHypervisor {
    /// Build from a testbed: host `i` of every cluster in `clusters` order,
    /// `hosts_per_cluster` hosts each, all powered on.
    pub fn from_testbed(testbed: &TestbedInfo, clusters: &[&str], hosts_per_cluster: usize) -> Self {
        let mut inner = Inner::default();
        for (c, cluster) in clusters.iter().enumerate() {
            let hosts: Vec<String> = testbed
                .esx_hosts
                .iter()
                .skip(c * hosts_per_cluster)
                .take(hosts_per_cluster)
                .map(|h| h.ip.clone())
                .collect();
            inner.clusters.insert(cluster.to_string(), hosts);
        }
        for (i, host) in testbed.esx_hosts.iter().enumerate() {
            inner.host_vms.insert(host.ip.clone(), host.vm_name.clone());
            inner.vms.push(MockVm {
                id: format!("vm-{}", 100 + i),
                name: host.vm_name.clone(),
                instance_uuid: format!("4237{:04}-0000-0000-0000-000000000000", i),
                state: PowerState::PoweredOn,
                pending: None,
            });
        }
        Self {
            inner: Mutex::new(inner),
            transition_reads: AtomicU32::new(0),
        }
    }

    /// Delay every power change by `reads` state reads
    pub fn with_transition_reads(self, reads: u32) -> Self {
        self.set_transition_reads(reads);
        self
    }

    pub fn set_transition_reads(&self, reads: u32) {
        self.transition_reads.store(reads, Ordering::SeqCst);
    }

    /// Add a standalone VM (a cluster node) and return its id
    pub fn add_vm(&self, name: &str, instance_uuid: &str, state: PowerState) -> String {
        let mut inner = self.inner.lock().unwrap();
        let id = format!("vm-{}", 900 + inner.vms.len());
        inner.vms.push(MockVm {
            id: id.clone(),
            name: name.to_string(),
            instance_uuid: instance_uuid.to_string(),
            state,
            pending: None,
        });
        id
    }

    /// Force a VM's state, bypassing the power API
    pub fn set_state(&self, name: &str, state: PowerState) {
        let mut inner = self.inner.lock().unwrap();
        let vm = inner.vms.iter_mut().find(|v| v.name == name).unwrap();
        vm.state = state;
        vm.pending = None;
    }

    pub fn state_of(&self, name: &str) -> PowerState {
        let inner = self.inner.lock().unwrap();
        inner.vms.iter().find(|v| v.name == name).unwrap().state
    }

    /// Every power request issued so far, as `(vm id, requested state)`
    pub fn power_requests(&self) -> Vec<(String, PowerState)> {
        self.inner.lock().unwrap().power_requests.clone()
    }

    fn host_summary(inner: &Inner, ip: &str) -> HostSummary {
        let connected = inner
            .host_vms
            .get(ip)
            .and_then(|vm| inner.vms.iter().find(|v| &v.name == vm))
            .is_some_and(|vm| vm.state == PowerState::PoweredOn);
        HostSummary {
            host: format!("host-{}", ip.replace('.', "-")),
            name: ip.to_string(),
            connection_state: if connected {
                ConnectionState::Connected
            } else {
                ConnectionState::NotResponding
            },
            power_state: connected.then(|| "POWERED_ON".to_string()),
        }
    }

    fn summary(vm: &MockVm) -> VmSummary {
        VmSummary {
            vm: vm.id.clone(),
            name: vm.name.clone(),
            power_state: vm.state,
        }
    }
}

fn not_found(what: String) -> Error {
    Error::Vsphere {
        status: 404,
        message: what,
    }
}

impl Hypervisor for MockHypervisor {
    async fn cluster_hosts(&self, cluster: &str) -> Result<Vec<HostSummary>> {
        let inner = self.inner.lock().unwrap();
        let hosts = inner
            .clusters
            .get(cluster)
            .ok_or_else(|| not_found(format!("cluster {} not found", cluster)))?;
        Ok(hosts.iter().map(|ip| Self::host_summary(&inner, ip)).collect())
    }

    async fn host_by_name(&self, name: &str) -> Result<Option<HostSummary>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .host_vms
            .contains_key(name)
            .then(|| Self::host_summary(&inner, name)))
    }

    async fn vm_by_name(&self, name: &str) -> Result<Option<VmSummary>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.vms.iter().find(|v| v.name == name).map(Self::summary))
    }

    async fn vm_by_instance_uuid(&self, uuid: &str) -> Result<Option<VmSummary>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .vms
            .iter()
            .find(|v| v.instance_uuid.eq_ignore_ascii_case(uuid))
            .map(Self::summary))
    }

    async fn vm_power_state(&self, vm: &str) -> Result<PowerState> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .vms
            .iter_mut()
            .find(|v| v.id == vm)
            .ok_or_else(|| not_found(format!("VM {} not found", vm)))?;
        if let Some((target, reads)) = entry.pending {
            if reads == 0 {
                entry.state = target;
                entry.pending = None;
            } else {
                entry.pending = Some((target, reads - 1));
            }
        }
        Ok(entry.state)
    }

    async fn set_vm_power(&self, vm: &str, state: PowerState) -> Result<()> {
        let transition_reads = self.transition_reads.load(Ordering::SeqCst);
        let mut inner = self.inner.lock().unwrap();
        inner.power_requests.push((vm.to_string(), state));
        let entry = inner
            .vms
            .iter_mut()
            .find(|v| v.id == vm)
            .ok_or_else(|| not_found(format!("VM {} not found", vm)))?;
        if entry.state == state {
            return Err(Error::Vsphere {
                status: 400,
                message: format!("ALREADY_IN_DESIRED_STATE: {} is already {}", vm, state),
            });
        }
        if transition_reads == 0 {
            entry.state = state;
        } else {
            entry.pending = Some((state, transition_reads));
        }
        Ok(())
    }
}
