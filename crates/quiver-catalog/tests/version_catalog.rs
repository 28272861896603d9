//! Integration tests for version lineage under concurrency.

use std::collections::BTreeSet;

use quiver_catalog::array::MAX_COORDINATE;
use quiver_catalog::{PhysicalBoundaries, VersionSelector};
use quiver_core::id::{ArrayId, VersionId};
use quiver_core::lock_mode::LockMode;
use quiver_test_utils::{
    SimulatedCluster, coordinator_lock, create_array, create_version, dense_schema,
    init_test_logging, version,
};

/// Concurrent version creators on different instances get distinct,
/// gap-free version numbers.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_versions_are_sequential() {
    init_test_logging();
    let cluster = SimulatedCluster::new(6);
    let base = create_array(cluster.catalog(0), "A").await;

    let handles: Vec<_> = cluster
        .catalogs()
        .iter()
        .cloned()
        .map(|catalog| {
            let base = base.clone();
            tokio::spawn(async move { create_version(&catalog, &base).await })
        })
        .collect();

    let mut versions = BTreeSet::new();
    let mut rows = BTreeSet::new();
    for handle in handles {
        let created = handle.await.unwrap();
        versions.insert(created.version);
        rows.insert(created.id);
    }

    let expected: BTreeSet<VersionId> = (1..=6).map(version).collect();
    assert_eq!(versions, expected);
    assert_eq!(rows.len(), 6);
    assert_eq!(cluster.memory().version_rows().await.len(), 6);
}

/// Two racing versions: one gets 1, the other 2, and both rows exist.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_racing_versions() {
    let cluster = SimulatedCluster::new(2);
    let base = create_array(cluster.catalog(0), "A").await;

    let (first, second) = tokio::join!(
        create_version(cluster.catalog(0), &base),
        create_version(cluster.catalog(1), &base),
    );

    let versions: BTreeSet<_> = [first.version, second.version].into_iter().collect();
    assert_eq!(versions, [version(1), version(2)].into_iter().collect());
    assert_ne!(first.id, second.id);

    let max_id = cluster.memory().max_array_id().await;
    assert!(first.id <= max_id && second.id <= max_id);

    for created in [&first, &second] {
        let stored = cluster
            .catalog(1)
            .metadata()
            .get_array_desc(&created.name, ArrayId::MAX)
            .await
            .unwrap();
        assert_eq!(stored.id, created.id);
        assert_eq!(stored.uaid, base.id);
    }
}

/// The first version is stored together with its new base array.
#[tokio::test]
async fn test_first_version_creates_base() {
    let cluster = SimulatedCluster::new(1);
    let catalog = cluster.catalog(0);
    let base_id = catalog.metadata().get_next_array_id().await.unwrap();
    let version_id = catalog.metadata().get_next_array_id().await.unwrap();
    let base = dense_schema("B").with_ids(base_id, base_id);
    let template = dense_schema("B").with_ids(version_id, base_id);

    let issued = catalog
        .versions()
        .add_array_version(Some(&base), &template)
        .await
        .unwrap();

    assert_eq!(issued, version(1));
    assert!(catalog.metadata().contains_array("B").await.unwrap());
    let latest = catalog
        .metadata()
        .get_array_desc_at("B", ArrayId::MAX, VersionSelector::Latest)
        .await
        .unwrap();
    assert_eq!(latest.name, "B@1");
    assert_eq!(latest.id, version_id);
}

/// A horizon taken before later versions hides them from readers.
#[tokio::test]
async fn test_horizon_gives_consistent_snapshot() {
    let cluster = SimulatedCluster::new(2);
    let writer = cluster.catalog(0);
    let reader = cluster.catalog(1);
    let base = create_array(writer, "A").await;
    let v1 = create_version(writer, &base).await;
    let horizon = cluster.memory().max_array_id().await;
    let v2 = create_version(writer, &base).await;

    let as_of = reader
        .metadata()
        .get_array_desc_at("A", horizon, VersionSelector::Latest)
        .await
        .unwrap();
    assert_eq!(as_of.name, v1.name);
    assert_eq!(as_of.version, version(1));

    let latest = reader
        .metadata()
        .get_array_desc_at("A", ArrayId::MAX, VersionSelector::Latest)
        .await
        .unwrap();
    assert_eq!(latest.id, v2.id);

    let hidden = reader
        .metadata()
        .find_array_desc_at("A", horizon, VersionSelector::Exact(version(2)))
        .await
        .unwrap();
    assert!(hidden.is_none());

    let last = reader.versions().get_last_version(base.id, horizon).await.unwrap();
    assert_eq!(last, version(1));
}

/// Resolving current versions stamps each lock with its array's newest row.
#[tokio::test]
async fn test_current_version_stamps_locks() {
    let cluster = SimulatedCluster::new(1);
    let catalog = cluster.catalog(0);
    let a = create_array(catalog, "A").await;
    let a1 = create_version(catalog, &a).await;
    let b = create_array(catalog, "B").await;
    let _b1 = create_version(catalog, &b).await;
    let b2 = create_version(catalog, &b).await;

    let mut locks = vec![
        coordinator_lock("A", 1, 0, LockMode::Rd),
        coordinator_lock("B@1", 1, 0, LockMode::Rd),
        coordinator_lock("missing", 1, 0, LockMode::Rd),
    ];
    catalog.versions().get_current_version(&mut locks).await.unwrap();

    assert_eq!(locks[0].array_catalog_id, a1.id);
    assert_eq!(locks[1].array_catalog_id, b2.id);
    assert_eq!(locks[2].array_catalog_id, ArrayId::INVALID);
}

/// Boundary widening lands on the row of the descriptor that wrote data.
#[tokio::test]
async fn test_latest_version_reports_its_own_boundaries() {
    let cluster = SimulatedCluster::new(1);
    let catalog = cluster.catalog(0);
    let base = create_array(catalog, "A").await;
    let v1 = create_version(catalog, &base).await;

    let bounds = PhysicalBoundaries::new(vec![3, 4], vec![7, 8]);
    catalog.versions().update_array_boundaries(&v1, &bounds).await.unwrap();

    let latest = catalog
        .metadata()
        .get_array_desc_at("A", ArrayId::MAX, VersionSelector::Latest)
        .await
        .unwrap();
    assert_eq!(latest.id, v1.id);
    let low: Vec<i64> = latest.dimensions.iter().map(|d| d.curr_start).collect();
    let high: Vec<i64> = latest.dimensions.iter().map(|d| d.curr_end).collect();
    assert_eq!(low, vec![3, 4]);
    assert_eq!(high, vec![7, 8]);

    let base_low = catalog.versions().get_low_boundary(base.id).await.unwrap();
    assert_eq!(base_low, vec![MAX_COORDINATE, MAX_COORDINATE]);
}
