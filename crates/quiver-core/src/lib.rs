//! # quiver-core
//!
//! Shared primitives for the Quiver array catalog.
//!
//! - **Identifiers**: strongly-typed array, version, query and instance ids
//! - **Lock modes**: the persisted mode and role codes of array locks
//! - **Store contract**: transactions, named statements, rows, and failure
//!   classification consumed by the catalog
//! - **Memory store**: an in-process implementation of the store contract
//! - **Configuration** and **observability** helpers
//!
//! ## Example
//!
//! ```rust
//! use quiver_core::prelude::*;
//!
//! let store = MemoryStore::new();
//! let config = CatalogConfig::default();
//! assert_eq!(config.serialized_txn_tries, 10);
//! # let _ = store;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod id;
pub mod lock_mode;
pub mod memory;
pub mod observability;
pub mod store;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::CatalogConfig;
    pub use crate::error::{Error, Result};
    pub use crate::id::{ArrayId, InstanceId, QueryId, VersionId};
    pub use crate::lock_mode::{InstanceRole, LockMode};
    pub use crate::memory::MemoryStore;
    pub use crate::store::{
        FailureKind, IsolationLevel, QueryResult, Row, Statement, StoreError, StoreResult,
        StoreTransaction, Table, TransactionalStore,
    };
}

pub use config::CatalogConfig;
pub use error::{Error, Result};
pub use memory::MemoryStore;
