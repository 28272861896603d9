//! # quiver-catalog
//!
//! System catalog for the Quiver array cluster.
//!
//! This crate is the single source of truth for array schemas, version
//! lineage and cluster membership, and implements the cluster-wide array
//! lock protocol:
//!
//! - **Restartable execution**: every operation is a unit of work retried on
//!   connection loss and, at serializable isolation, on serialization
//!   conflicts
//! - **Array locks**: compare-and-insert lock rows that serialize structural
//!   array operations across coordinator and worker instances
//! - **Versions**: per-array version numbers issued atomically with their
//!   array rows, and "as of" resolution against a catalog horizon
//! - **Metadata**: array descriptors, instances, libraries, cluster identity,
//!   and namespace/user delegation to an optional extension
//!
//! ## Consistency
//!
//! Cross-process correctness rests entirely on the store's serializable
//! isolation. Nothing is locked in application memory except the
//! connection handle, which only keeps local callers from sharing one
//! open transaction.
//!
//! ## Example
//!
//! ```rust,ignore
//! use quiver_catalog::prelude::*;
//!
//! let catalog = SystemCatalog::new(Arc::new(MemoryStore::new()), &CatalogConfig::default());
//! catalog.open().await?;
//!
//! let mut lock = LockDesc::new("A", query_id, instance_id, InstanceRole::Coord, LockMode::Wr);
//! catalog.locks().lock_array(&mut lock, None).await?;
//! let version = catalog.versions().add_array_version(None, &next).await?;
//! catalog.locks().unlock_array(&mut lock).await?;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod array;
pub mod catalog;
pub mod connection;
pub mod error;
pub mod executor;
pub mod lock;
pub mod metadata;
pub mod metrics;
pub mod namespace;
pub mod version;

// Re-export main types at crate root
pub use array::{ArrayDesc, AttributeDesc, DimensionDesc, PhysicalBoundaries};
pub use catalog::SystemCatalog;
pub use error::{CatalogError, Result};
pub use executor::{RestartableExecutor, RetryPolicy};
pub use lock::{InstanceLocks, LockDesc, LockManager};
pub use metadata::{ClusterIdentity, InstanceDesc, MetadataStore, VersionSelector};
pub use namespace::{AuthorizationExtension, NamespaceDesc, Namespaces, UserDesc};
pub use version::{VersionCatalog, VersionDesc};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::array::{ArrayDesc, AttributeDesc, DimensionDesc, PhysicalBoundaries};
    pub use crate::catalog::SystemCatalog;
    pub use crate::error::{CatalogError, Result};
    pub use crate::lock::{InstanceLocks, LockDesc};
    pub use crate::metadata::VersionSelector;
    pub use crate::namespace::NamespaceDesc;
    pub use quiver_core::prelude::*;
}
