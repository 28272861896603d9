//! Test data factories.

use quiver_catalog::{ArrayDesc, AttributeDesc, DimensionDesc, LockDesc, SystemCatalog};
use quiver_core::id::{InstanceId, QueryId, VersionId};
use quiver_core::lock_mode::{InstanceRole, LockMode};

/// A two-dimensional dense schema with one `double` attribute and no ids.
pub fn dense_schema(name: &str) -> ArrayDesc {
    ArrayDesc::new(
        name,
        vec![AttributeDesc::new("value", "double")],
        vec![
            DimensionDesc::new("row", 0, 9_999, 1_000),
            DimensionDesc::new("col", 0, 9_999, 1_000),
        ],
    )
}

/// Stores a new unversioned dense array named `name` and returns it.
pub async fn create_array(catalog: &SystemCatalog, name: &str) -> ArrayDesc {
    let id = catalog
        .metadata()
        .get_next_array_id()
        .await
        .expect("array id");
    let desc = dense_schema(name).with_ids(id, id);
    catalog.metadata().add_array(&desc).await.expect("add array");
    desc
}

/// Stores the next version of `base` and returns the versioned row.
pub async fn create_version(catalog: &SystemCatalog, base: &ArrayDesc) -> ArrayDesc {
    let id = catalog
        .metadata()
        .get_next_array_id()
        .await
        .expect("array id");
    let template = base.clone().with_ids(id, base.uaid);
    let version = catalog
        .versions()
        .add_array_version(None, &template)
        .await
        .expect("add version");
    base.versioned(id, version)
}

/// A coordinator lock request.
pub fn coordinator_lock(name: &str, query: u64, instance: u64, mode: LockMode) -> LockDesc {
    LockDesc::new(
        name,
        QueryId::new(query),
        InstanceId::new(instance),
        InstanceRole::Coord,
        mode,
    )
}

/// A worker lock request.
pub fn worker_lock(name: &str, query: u64, instance: u64, mode: LockMode) -> LockDesc {
    LockDesc::new(
        name,
        QueryId::new(query),
        InstanceId::new(instance),
        InstanceRole::Worker,
        mode,
    )
}

/// Shorthand for a version number.
pub const fn version(v: u64) -> VersionId {
    VersionId::new(v)
}
