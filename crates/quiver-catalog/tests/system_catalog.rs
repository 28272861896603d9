//! Integration tests for catalog startup and instance membership.

use std::collections::BTreeSet;

use quiver_catalog::ArrayDesc;
use quiver_core::id::{ArrayId, InstanceId};
use quiver_test_utils::{SimulatedCluster, dense_schema};

/// Instances starting together agree on one cluster identity.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_open_agrees_on_identity() {
    let cluster = SimulatedCluster::new(4);

    let handles: Vec<_> = cluster
        .catalogs()
        .iter()
        .cloned()
        .map(|catalog| tokio::spawn(async move { catalog.open().await }))
        .collect();

    let mut identities = BTreeSet::new();
    for handle in handles {
        let identity = handle.await.unwrap().unwrap();
        identities.insert(identity.uuid);
    }
    assert_eq!(identities.len(), 1);
}

/// Restarting the cluster invalidates transient arrays but keeps others.
#[tokio::test]
async fn test_restart_invalidates_only_transient_arrays() {
    let cluster = SimulatedCluster::new(1);
    let catalog = cluster.catalog(0);
    for (name, flags) in [("kept", 0), ("scratch", ArrayDesc::TRANSIENT)] {
        let id = catalog.metadata().get_next_array_id().await.unwrap();
        let desc = dense_schema(name).with_ids(id, id).with_flags(flags);
        catalog.metadata().add_array(&desc).await.unwrap();
    }

    catalog.open().await.unwrap();

    let kept = catalog.metadata().get_array_desc("kept", ArrayId::MAX).await.unwrap();
    let scratch = catalog.metadata().get_array_desc("scratch", ArrayId::MAX).await.unwrap();
    assert!(!kept.is_invalid());
    assert!(scratch.is_invalid());
    assert!(scratch.is_transient());
}

/// Instances registered from different catalogs get distinct ids and
/// track their online state.
#[tokio::test]
async fn test_instance_membership() {
    let cluster = SimulatedCluster::new(2);
    let first = cluster
        .catalog(0)
        .metadata()
        .add_instance("node-a", 1239, "/data/a")
        .await
        .unwrap();
    let second = cluster
        .catalog(1)
        .metadata()
        .add_instance("node-b", 1239, "/data/b")
        .await
        .unwrap();
    assert_ne!(first, second);

    let metadata = cluster.catalog(0).metadata();
    metadata.mark_instance_online(second, "node-b", 1240).await.unwrap();
    let online = metadata.get_instance(second).await.unwrap();
    assert!(online.is_online());
    assert_eq!(online.port, 1240);

    metadata.mark_instance_offline(second).await.unwrap();
    assert!(!metadata.get_instance(second).await.unwrap().is_online());

    assert_eq!(metadata.get_instances().await.unwrap().len(), 2);
    assert!(metadata.get_instance(InstanceId::new(99)).await.is_err());
}
