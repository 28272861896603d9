//! The system catalog facade.

use std::sync::Arc;

use quiver_core::config::CatalogConfig;
use quiver_core::observability::catalog_span;
use quiver_core::store::TransactionalStore;
use tracing::Instrument;

use crate::connection::CatalogConnection;
use crate::error::Result;
use crate::lock::LockManager;
use crate::metadata::{ClusterIdentity, MetadataStore};
use crate::metrics;
use crate::namespace::{AuthorizationExtension, Namespaces};
use crate::version::VersionCatalog;

/// One process's view of the cluster catalog.
///
/// All components share a single connection handle, so at most one
/// transaction per `SystemCatalog` is open at a time. Separate instances
/// over the same store behave like separate cluster processes.
#[derive(Debug, Clone)]
pub struct SystemCatalog {
    locks: LockManager,
    versions: VersionCatalog,
    metadata: MetadataStore,
    namespaces: Namespaces,
}

impl SystemCatalog {
    /// Creates a catalog over `store` without an authorization extension.
    #[must_use]
    pub fn new(store: Arc<dyn TransactionalStore>, config: &CatalogConfig) -> Self {
        let connection = CatalogConnection::new(store);
        Self {
            locks: LockManager::new(connection.clone(), config),
            versions: VersionCatalog::new(connection.clone(), config),
            metadata: MetadataStore::new(connection, config),
            namespaces: Namespaces::default(),
        }
    }

    /// Installs an authorization extension for namespace and user calls.
    #[must_use]
    pub fn with_extension(mut self, extension: Arc<dyn AuthorizationExtension>) -> Self {
        self.namespaces = Namespaces::new(Some(extension));
        self
    }

    /// Prepares the catalog for use after a process start: registers metric
    /// descriptions, establishes the cluster identity and invalidates
    /// transient arrays left behind by a previous run.
    ///
    /// # Errors
    ///
    /// Returns any error from the underlying metadata operations.
    pub async fn open(&self) -> Result<ClusterIdentity> {
        self.open_inner().instrument(catalog_span("open")).await
    }

    async fn open_inner(&self) -> Result<ClusterIdentity> {
        metrics::register_metrics();
        let identity = self.metadata.initialize_cluster().await?;
        self.metadata.invalidate_temp_arrays().await?;
        Ok(identity)
    }

    /// The array lock manager.
    #[must_use]
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// The version catalog.
    #[must_use]
    pub fn versions(&self) -> &VersionCatalog {
        &self.versions
    }

    /// Array schemas, instances, libraries and cluster identity.
    #[must_use]
    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    /// Namespace and user delegation.
    #[must_use]
    pub fn namespaces(&self) -> &Namespaces {
        &self.namespaces
    }
}

#[cfg(test)]
mod tests {
    use quiver_core::id::ArrayId;
    use quiver_core::memory::MemoryStore;

    use super::*;
    use crate::array::{ArrayDesc, AttributeDesc, DimensionDesc};

    #[tokio::test]
    async fn test_open_is_idempotent_and_invalidates_temp_arrays() {
        let store = Arc::new(MemoryStore::new());
        let catalog = SystemCatalog::new(store.clone(), &CatalogConfig::default());

        let id = catalog.metadata().get_next_array_id().await.expect("id");
        let temp = ArrayDesc::new(
            "T",
            vec![AttributeDesc::new("v", "int64")],
            vec![DimensionDesc::new("i", 0, 9, 10)],
        )
        .with_ids(id, id)
        .with_flags(ArrayDesc::TRANSIENT);
        catalog.metadata().add_array(&temp).await.expect("add");

        let first = catalog.open().await.expect("open");
        let restarted = SystemCatalog::new(store, &CatalogConfig::default());
        let second = restarted.open().await.expect("reopen");
        assert_eq!(first, second);

        let temp = restarted
            .metadata()
            .get_array_desc("T", ArrayId::MAX)
            .await
            .expect("temp");
        assert!(temp.is_invalid());
        assert!(!restarted.namespaces().has_extension());
    }
}
