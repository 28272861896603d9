//! Simulated clusters for concurrency tests.
//!
//! Each simulated instance is a separate [`SystemCatalog`] with its own
//! connection handle, so instances contend only through the shared store,
//! the same way separate processes would.

use std::sync::Arc;

use quiver_catalog::SystemCatalog;
use quiver_core::config::CatalogConfig;
use quiver_core::memory::MemoryStore;
use quiver_core::store::TransactionalStore;

use crate::fault::FaultInjectingStore;

/// Several catalogs sharing one in-memory store.
#[derive(Debug, Clone)]
pub struct SimulatedCluster {
    memory: MemoryStore,
    catalogs: Vec<SystemCatalog>,
}

impl SimulatedCluster {
    /// Creates `instances` catalogs with the default configuration.
    pub fn new(instances: usize) -> Self {
        Self::with_config(instances, &CatalogConfig::default())
    }

    /// Creates `instances` catalogs with `config`.
    pub fn with_config(instances: usize, config: &CatalogConfig) -> Self {
        let memory = MemoryStore::new();
        let store: Arc<dyn TransactionalStore> = Arc::new(memory.clone());
        Self::build(memory, &store, instances, config)
    }

    /// Creates `instances` catalogs whose store calls pass through a shared
    /// [`FaultInjectingStore`].
    pub fn with_faults(instances: usize, config: &CatalogConfig) -> (Self, FaultInjectingStore) {
        let memory = MemoryStore::new();
        let faults = FaultInjectingStore::new(Arc::new(memory.clone()));
        let store: Arc<dyn TransactionalStore> = Arc::new(faults.clone());
        (Self::build(memory, &store, instances, config), faults)
    }

    fn build(
        memory: MemoryStore,
        store: &Arc<dyn TransactionalStore>,
        instances: usize,
        config: &CatalogConfig,
    ) -> Self {
        let catalogs = (0..instances)
            .map(|_| SystemCatalog::new(Arc::clone(store), config))
            .collect();
        Self { memory, catalogs }
    }

    /// Returns the catalog of instance `index`.
    pub fn catalog(&self, index: usize) -> &SystemCatalog {
        &self.catalogs[index]
    }

    /// Returns every instance's catalog.
    pub fn catalogs(&self) -> &[SystemCatalog] {
        &self.catalogs
    }

    /// Returns the number of simulated instances.
    pub fn len(&self) -> usize {
        self.catalogs.len()
    }

    /// Returns whether the cluster has no instances.
    pub fn is_empty(&self) -> bool {
        self.catalogs.is_empty()
    }

    /// Returns the shared store, for inspecting committed rows.
    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }
}
