//! Catalog connection handle.
//!
//! The store client behind a catalog is not assumed to be safe for
//! concurrent use, so every transaction holds the handle's mutex from begin
//! until commit or rollback. The mutex belongs to the handle, never to a
//! retry loop: each attempt of a unit of work reacquires it.

use std::sync::Arc;
use std::time::Instant;

use quiver_core::store::{
    FailureKind, IsolationLevel, QueryResult, Statement, StoreTransaction, TransactionalStore,
};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{CatalogError, Result};
use crate::metrics;

/// A handle to the transactional store shared by one catalog instance.
#[derive(Clone)]
pub struct CatalogConnection {
    store: Arc<dyn TransactionalStore>,
    handle: Arc<Mutex<()>>,
}

impl std::fmt::Debug for CatalogConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogConnection").finish_non_exhaustive()
    }
}

impl CatalogConnection {
    /// Wraps a store with a fresh handle mutex.
    #[must_use]
    pub fn new(store: Arc<dyn TransactionalStore>) -> Self {
        Self {
            store,
            handle: Arc::new(Mutex::new(())),
        }
    }

    /// Begins a transaction, holding the handle until it finishes.
    ///
    /// # Errors
    ///
    /// Returns a store error if the transaction cannot be opened.
    pub async fn begin(&self, isolation: IsolationLevel) -> Result<ScopedTransaction> {
        let handle = Arc::clone(&self.handle).lock_owned().await;
        let inner = self.store.begin(isolation).await?;
        Ok(ScopedTransaction {
            inner,
            isolation,
            started: Instant::now(),
            _handle: handle,
        })
    }
}

/// A transaction bound to a catalog connection handle.
///
/// Finish it with [`ScopedTransaction::finish`]; dropping it rolls back.
pub struct ScopedTransaction {
    inner: Box<dyn StoreTransaction>,
    isolation: IsolationLevel,
    started: Instant,
    _handle: OwnedMutexGuard<()>,
}

impl ScopedTransaction {
    /// Returns the isolation level of this transaction.
    #[must_use]
    pub const fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Executes one statement.
    ///
    /// # Errors
    ///
    /// Returns the classified store failure.
    pub async fn execute(&mut self, statement: Statement) -> Result<QueryResult> {
        let result = self.inner.execute(&statement).await;
        result.map_err(|err| {
            match err.kind() {
                FailureKind::Other => tracing::error!(
                    statement = statement.name(),
                    error = err.message(),
                    "catalog statement failed"
                ),
                kind => tracing::debug!(
                    statement = statement.name(),
                    kind = kind.as_str(),
                    error = err.message(),
                    "catalog statement failed"
                ),
            }
            CatalogError::Store(err)
        })
    }

    /// Commits when `outcome` is `Ok`, rolls back otherwise.
    ///
    /// # Errors
    ///
    /// Returns the original failure on the error path, or the commit failure.
    pub async fn finish<T>(self, outcome: Result<T>) -> Result<T> {
        let isolation = self.isolation.as_str();
        let elapsed = self.started.elapsed().as_secs_f64();
        match outcome {
            Ok(value) => {
                self.inner.commit().await?;
                metrics::record_txn_duration(isolation, true, elapsed);
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = self.inner.rollback().await {
                    tracing::warn!(error = %rollback, "rollback failed after catalog error");
                }
                metrics::record_txn_duration(isolation, false, elapsed);
                Err(err)
            }
        }
    }
}
