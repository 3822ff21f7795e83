//! Snapshot and restore with a preferred datastore.
//!
//! A datastore of the first topology cluster is tagged as preferred for the
//! innermost topology value. A claim provisioned with that topology is
//! snapshotted, restored into a new claim, and the restored volume is
//! mounted in a pod that must land inside the same topology.
//!
//! Requires `TOPOLOGY_MAP`, `TOPOLOGY_CLUSTERS`,
//! `STORAGE_POLICY_FOR_SHARED_DATASTORES` and vCenter credentials.

use std::sync::Arc;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;
use uuid::Uuid;
use vsphere_csi_e2e::TopologyMap;
use vsphere_csi_e2e::k8s::pod::{PodBuilder, create_pod, delete_pod_and_wait, wait_for_pod_running};
use vsphere_csi_e2e::k8s::pvc::{
    PvcBuilder, create_pvc, delete_pvc, wait_for_claims_bound, wait_for_pv_deleted,
};
use vsphere_csi_e2e::k8s::snapshot::{
    create_volume_snapshot, delete_volume_snapshot, wait_for_snapshot_content_deleted,
    wait_for_snapshot_ready,
};
use vsphere_csi_e2e::k8s::storage_class::{BindingMode, StorageClassBuilder};

use crate::{
    ScopedSnapshotClass, ScopedStorageClass, TaggedDatastore, TestNamespace, WATCH_TIMEOUT,
    api_poller, assert_pod_topology, assert_volumes_within, init_test, wait_for_deletion,
};

/// Tag category the CSI driver reads preferred datastores from
const PREFERRED_DATASTORE_CATEGORY: &str = "cns.vmware.topology-preferred-datastores";

/// Restrict the innermost level to its first value; returns that value too
fn innermost_first(topology: &TopologyMap) -> (TopologyMap, String) {
    let names = topology.category_names();
    let level = names.last().expect("topology has levels");
    let value = topology.values(level).expect("level values")[0].clone();
    let restricted = topology
        .restricted(level, &[value.as_str()])
        .expect("restrict innermost level");
    (restricted, value)
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires vCenter and a topology-aware cluster with snapshot support"]
async fn test_snapshot_restore_with_preferred_datastore() {
    let cluster = init_test().await;
    let config = cluster.config();
    let (restricted, tag_name) = innermost_first(config.require_topology().unwrap());
    let allowed = restricted.allowed_topologies();
    let policy = config.require_storage_policy().unwrap().to_string();
    let vc = Arc::new(cluster.vsphere().await);
    let client = cluster.new_client().await;
    let poller = api_poller(config, "snapshot restore");

    // Mark the first shared datastore as preferred for the zone
    let vsphere_cluster = config.topology_cluster(0).unwrap();
    let datastores = vc
        .cluster_datastores(vsphere_cluster)
        .await
        .expect("Failed to list datastores");
    let preferred = datastores
        .iter()
        .find(|ds| ds.kind != "VMFS")
        .or_else(|| datastores.first())
        .unwrap_or_else(|| panic!("cluster {} has no datastores", vsphere_cluster))
        .clone();
    let category = vc
        .ensure_tag_category(PREFERRED_DATASTORE_CATEGORY)
        .await
        .expect("Failed to ensure tag category");
    let tag = vc
        .ensure_tag(&category, &tag_name)
        .await
        .expect("Failed to ensure tag");
    let _tagged = TaggedDatastore::attach(vc.clone(), &tag, &preferred.datastore).await;
    tracing::info!(datastore = %preferred.name, tag = %tag_name, "Tagged preferred datastore");

    let ns = TestNamespace::create(client.clone(), "snapshot").await;
    let sc = ScopedStorageClass::create(
        client.clone(),
        StorageClassBuilder::new()
            .storage_policy(policy)
            .allowed_topology(&restricted)
            .binding_mode(BindingMode::Immediate),
    )
    .await;

    let source = create_pvc(&client, &PvcBuilder::new(ns.name()).storage_class(sc.name()).build())
        .await
        .expect("source claim should be created");
    let source_volumes = wait_for_claims_bound(&client, ns.name(), &[source.name_any()], &poller)
        .await
        .expect("source claim should bind");
    assert_volumes_within(&source_volumes, &allowed);

    let class = ScopedSnapshotClass::create(
        client.clone(),
        format!("e2e-snapclass-{}", &Uuid::new_v4().to_string()[..8]),
    )
    .await;
    let snapshot = create_volume_snapshot(&client, ns.name(), class.name(), &source.name_any())
        .await
        .expect("snapshot should be created");
    let ready = wait_for_snapshot_ready(&client, ns.name(), &snapshot.name_any(), &poller)
        .await
        .expect("snapshot should become ready");

    let mut restore = PvcBuilder::new(ns.name())
        .storage_class(sc.name())
        .from_snapshot(snapshot.name_any());
    if let Some(size) = ready.restore_size.clone() {
        restore = restore.size(size);
    }
    let restored = create_pvc(&client, &restore.build())
        .await
        .expect("restored claim should be created");
    let restored_volumes =
        wait_for_claims_bound(&client, ns.name(), &[restored.name_any()], &poller)
            .await
            .expect("restored claim should bind");
    assert_volumes_within(&restored_volumes, &allowed);

    let pod = create_pod(
        &client,
        &PodBuilder::new(ns.name(), config.busybox_image.clone())
            .claim(restored.name_any())
            .build(),
    )
    .await
    .expect("pod should be created");
    let pod = wait_for_pod_running(&client, ns.name(), &pod.name_any(), &poller)
        .await
        .expect("pod using the restored volume should run");
    assert_pod_topology(&client, &pod, &allowed).await;

    // Cleanup in dependency order: pod, restored claim, snapshot, source.
    // The snapshot class and datastore tag go when their guards drop.
    delete_pod_and_wait(&client, ns.name(), &pod.name_any(), &poller)
        .await
        .expect("pod should be deleted");
    delete_pvc(&client, ns.name(), &restored.name_any())
        .await
        .expect("restored claim should be deleted");
    wait_for_deletion(
        &ns.api::<PersistentVolumeClaim>(),
        &restored.name_any(),
        WATCH_TIMEOUT,
    )
    .await
    .expect("restored claim should be gone before its snapshot");
    delete_volume_snapshot(&client, ns.name(), &snapshot.name_any())
        .await
        .expect("snapshot should be deleted");
    wait_for_snapshot_content_deleted(&client, &ready.content_name, &poller)
        .await
        .expect("snapshot content should be deleted");
    delete_pvc(&client, ns.name(), &source.name_any())
        .await
        .expect("source claim should be deleted");
    for pv in restored_volumes.iter().chain(&source_volumes) {
        wait_for_pv_deleted(&client, &pv.name_any(), &poller)
            .await
            .expect("volume should be deleted");
    }
}
