//! Idempotent power operations and host outages against the mock hypervisor.

use std::sync::Arc;
use std::time::Duration;

use vsphere_csi_e2e::vsphere::power::{power_off_hosts_in_cluster, power_on_host, power_on_node};
use vsphere_csi_e2e::vsphere::{HostOutage, Hypervisor, PowerChange, PowerState};
use vsphere_csi_e2e::vsphere::{power_off_vm, power_on_vm};
use vsphere_csi_e2e::{Error, Poller};

use crate::MockHypervisor;
use crate::common::fixtures::{NodeBuilder, nested_testbed};

const CLUSTERS: [&str; 2] = ["cluster1", "cluster2"];

fn poller() -> Poller {
    Poller::new("power", Duration::from_secs(1), Duration::from_secs(30))
}

fn two_site_mock() -> MockHypervisor {
    MockHypervisor::from_testbed(&nested_testbed(2, 3), &CLUSTERS, 3)
}

// ============================================================================
// Idempotent VM power
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_power_on_running_vm_sends_nothing() {
    let hv = two_site_mock();

    let change = power_on_vm(&hv, "vm-100", &poller()).await.unwrap();

    assert_eq!(change, PowerChange::AlreadyInState);
    assert!(hv.power_requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_power_off_then_off_again_is_idempotent() {
    let hv = two_site_mock();

    let first = power_off_vm(&hv, "vm-100", &poller()).await.unwrap();
    let second = power_off_vm(&hv, "vm-100", &poller()).await.unwrap();

    assert_eq!(first, PowerChange::Changed);
    assert_eq!(second, PowerChange::AlreadyInState);
    assert_eq!(
        hv.power_requests(),
        vec![("vm-100".to_string(), PowerState::PoweredOff)]
    );
    assert_eq!(hv.state_of("esxi-0-0"), PowerState::PoweredOff);
}

#[tokio::test(start_paused = true)]
async fn test_raw_power_request_rejects_redundant_change() {
    let hv = two_site_mock();

    let err = hv
        .set_vm_power("vm-100", PowerState::PoweredOn)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Vsphere { status: 400, .. }));
}

#[tokio::test(start_paused = true)]
async fn test_power_change_waits_for_observed_state() {
    let hv = two_site_mock().with_transition_reads(3);

    let start = tokio::time::Instant::now();
    let change = power_off_vm(&hv, "vm-101", &poller()).await.unwrap();

    assert_eq!(change, PowerChange::Changed);
    assert_eq!(hv.state_of("esxi-0-1"), PowerState::PoweredOff);
    // Three reads still report the old state, one interval apart
    assert_eq!(start.elapsed(), Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_power_change_times_out_when_state_never_converges() {
    let hv = two_site_mock().with_transition_reads(1000);
    let poller = Poller::new("power", Duration::from_secs(1), Duration::from_secs(5));

    let err = power_off_vm(&hv, "vm-102", &poller).await.unwrap_err();

    assert!(matches!(err, Error::Timeout { .. }));
    assert!(err.to_string().contains("vm-102"));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_vm_is_an_error() {
    let hv = two_site_mock();

    let err = power_on_vm(&hv, "vm-404", &poller()).await.unwrap_err();

    assert!(err.is_not_found());
}

// ============================================================================
// Nested hosts
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_power_off_hosts_takes_first_connected_hosts() {
    let testbed = nested_testbed(2, 3);
    let hv = MockHypervisor::from_testbed(&testbed, &CLUSTERS, 3);

    let down = power_off_hosts_in_cluster(&hv, &testbed, "cluster1", 2, &poller())
        .await
        .unwrap();

    assert_eq!(down, vec!["esxi-0-0".to_string(), "esxi-0-1".to_string()]);
    let hosts = hv.cluster_hosts("cluster1").await.unwrap();
    let connected: Vec<_> = hosts.iter().filter(|h| h.is_connected()).collect();
    assert_eq!(connected.len(), 1);
    assert_eq!(connected[0].name, "10.0.0.13");
    // The other site is untouched
    let other = hv.cluster_hosts("cluster2").await.unwrap();
    assert!(other.iter().all(|h| h.is_connected()));
}

#[tokio::test(start_paused = true)]
async fn test_power_off_skips_hosts_already_down() {
    let testbed = nested_testbed(1, 3);
    let hv = MockHypervisor::from_testbed(&testbed, &["cluster1"], 3);
    hv.set_state("esxi-0-0", PowerState::PoweredOff);

    let down = power_off_hosts_in_cluster(&hv, &testbed, "cluster1", 1, &poller())
        .await
        .unwrap();

    assert_eq!(down, vec!["esxi-0-1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_power_off_more_hosts_than_connected_fails_before_acting() {
    let testbed = nested_testbed(1, 2);
    let hv = MockHypervisor::from_testbed(&testbed, &["cluster1"], 2);

    let err = power_off_hosts_in_cluster(&hv, &testbed, "cluster1", 3, &poller())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Assertion(_)));
    assert!(hv.power_requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_power_off_unknown_cluster() {
    let testbed = nested_testbed(1, 2);
    let hv = MockHypervisor::from_testbed(&testbed, &["cluster1"], 2);

    let err = power_off_hosts_in_cluster(&hv, &testbed, "cluster9", 1, &poller())
        .await
        .unwrap_err();

    assert!(err.is_not_found());
}

#[tokio::test(start_paused = true)]
async fn test_power_on_host_waits_for_reconnect() {
    let testbed = nested_testbed(1, 3);
    let hv = MockHypervisor::from_testbed(&testbed, &["cluster1"], 3).with_transition_reads(2);
    hv.set_state("esxi-0-2", PowerState::PoweredOff);

    let change = power_on_host(&hv, &testbed, "esxi-0-2", &poller())
        .await
        .unwrap();

    assert_eq!(change, PowerChange::Changed);
    let host = hv.host_by_name("10.0.0.13").await.unwrap().unwrap();
    assert!(host.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_power_on_host_not_in_testbed() {
    let testbed = nested_testbed(1, 1);
    let hv = MockHypervisor::from_testbed(&testbed, &["cluster1"], 1);

    let err = power_on_host(&hv, &testbed, "esxi-7-7", &poller())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Config(_)));
}

// ============================================================================
// Host outage guard
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_host_outage_restore_powers_hosts_back_on() {
    let testbed = nested_testbed(2, 3);
    let hv = Arc::new(MockHypervisor::from_testbed(&testbed, &CLUSTERS, 3));

    let outage = HostOutage::power_off(hv.clone(), testbed, "cluster2", 2, poller())
        .await
        .unwrap();
    assert_eq!(outage.hosts(), ["esxi-1-0", "esxi-1-1"]);
    assert_eq!(hv.state_of("esxi-1-0"), PowerState::PoweredOff);

    outage.restore().await.unwrap();

    let hosts = hv.cluster_hosts("cluster2").await.unwrap();
    assert!(hosts.iter().all(|h| h.is_connected()));
}

#[tokio::test(start_paused = true)]
async fn test_host_outage_absorb_restores_both_sites() {
    let testbed = nested_testbed(2, 3);
    let hv = Arc::new(MockHypervisor::from_testbed(&testbed, &CLUSTERS, 3));

    let mut outage = HostOutage::power_off(hv.clone(), testbed.clone(), "cluster1", 1, poller())
        .await
        .unwrap();
    let second = HostOutage::power_off(hv.clone(), testbed, "cluster2", 1, poller())
        .await
        .unwrap();
    outage.absorb(second);
    assert_eq!(outage.hosts(), ["esxi-0-0", "esxi-1-0"]);

    outage.restore().await.unwrap();

    assert_eq!(hv.state_of("esxi-0-0"), PowerState::PoweredOn);
    assert_eq!(hv.state_of("esxi-1-0"), PowerState::PoweredOn);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dropped_host_outage_restores_hosts() {
    let testbed = nested_testbed(1, 3);
    let hv = Arc::new(MockHypervisor::from_testbed(&testbed, &["cluster1"], 3));
    let fast = Poller::new("power", Duration::from_millis(10), Duration::from_secs(5));

    {
        let outage = HostOutage::power_off(hv.clone(), testbed, "cluster1", 2, fast)
            .await
            .unwrap();
        assert_eq!(outage.hosts().len(), 2);
        // Dropped without restore, as when an assertion fails mid-scenario
    }

    assert_eq!(hv.state_of("esxi-0-0"), PowerState::PoweredOn);
    assert_eq!(hv.state_of("esxi-0-1"), PowerState::PoweredOn);
}

#[tokio::test(start_paused = true)]
async fn test_restore_reports_every_failed_host() {
    let testbed = nested_testbed(1, 2);
    let hv = Arc::new(MockHypervisor::from_testbed(&testbed, &["cluster1"], 2));
    let outage = HostOutage::power_off(hv.clone(), testbed, "cluster1", 2, poller())
        .await
        .unwrap();

    // Hosts that never come back make every restore time out
    hv.set_transition_reads(10_000);
    let err = outage.restore().await.unwrap_err();

    match err {
        Error::Multiple(errors) => {
            assert_eq!(errors.len(), 2);
            assert!(errors[0].starts_with("esxi-0-0"));
            assert!(errors[1].starts_with("esxi-0-1"));
        }
        other => panic!("expected Multiple, got {:?}", other),
    }
}

// ============================================================================
// Cluster nodes
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_power_on_node_by_provider_id() {
    let hv = two_site_mock();
    let uuid = "4237aaaa-1111-2222-3333-444455556666";
    hv.add_vm("k8s-worker-1", uuid, PowerState::PoweredOff);
    let node = NodeBuilder::new("k8s-worker-1")
        .vm_uuid(&uuid.to_uppercase())
        .build();

    let change = power_on_node(&hv, &node, &poller()).await.unwrap();

    assert_eq!(change, PowerChange::Changed);
    assert_eq!(hv.state_of("k8s-worker-1"), PowerState::PoweredOn);
}

#[tokio::test(start_paused = true)]
async fn test_power_on_node_without_provider_id() {
    let hv = two_site_mock();
    let node = NodeBuilder::new("kind-worker").build();

    let err = power_on_node(&hv, &node, &poller()).await.unwrap_err();

    assert!(matches!(err, Error::Assertion(_)));
}
