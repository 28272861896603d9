//! Shared test utilities for Quiver catalog tests.
//!
//! This crate provides:
//! - [`FaultInjectingStore`]: a store wrapper that injects classified
//!   failures and records executed statements
//! - [`SimulatedCluster`]: several independent catalogs sharing one store
//! - Factory functions for array descriptors and lock requests
//!
//! # Example
//!
//! ```rust,ignore
//! use quiver_test_utils::{SimulatedCluster, coordinator_lock};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let cluster = SimulatedCluster::new(2);
//!     let mut lock = coordinator_lock("A", 1, 0, LockMode::Wr);
//!     cluster.catalog(0).locks().lock_array(&mut lock, None).await.unwrap();
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod fault;
pub mod fixtures;
pub mod simulation;

pub use fault::*;
pub use fixtures::*;
pub use simulation::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("quiver_catalog=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
