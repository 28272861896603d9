//! Restartable execution of catalog units of work.
//!
//! Every catalog operation is a unit of work: a closure that opens one
//! transaction, runs its statements and commits. [`RetryPolicy`] re-runs the
//! unit when it fails with one designated [`FailureKind`] and re-raises any
//! other failure on first occurrence. [`RestartableExecutor`] composes two
//! policies: connection loss on the outside, serialization conflicts on the
//! inside for work done at serializable isolation.
//!
//! Retries are immediate. Each attempt opens a fresh transaction, so the
//! connection handle is reacquired on every iteration.

use std::future::Future;

use quiver_core::config::CatalogConfig;
use quiver_core::store::FailureKind;

use crate::error::{CatalogError, Result};
use crate::metrics;

/// Retries a unit of work on one class of transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    name: &'static str,
    retry_on: FailureKind,
    max_tries: u32,
}

impl RetryPolicy {
    /// Retries on [`FailureKind::ConnectionLost`].
    #[must_use]
    pub const fn connection_loss(max_tries: u32) -> Self {
        Self {
            name: "connection_loss",
            retry_on: FailureKind::ConnectionLost,
            max_tries,
        }
    }

    /// Retries on [`FailureKind::SerializationConflict`].
    #[must_use]
    pub const fn serialization_conflict(max_tries: u32) -> Self {
        Self {
            name: "serialization_conflict",
            retry_on: FailureKind::SerializationConflict,
            max_tries,
        }
    }

    /// Returns the policy name used in logs and metrics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the maximum number of attempts.
    #[must_use]
    pub const fn max_tries(&self) -> u32 {
        self.max_tries
    }

    /// Runs `work` at most `max_tries` times.
    ///
    /// A budget of zero is treated as one attempt.
    ///
    /// # Errors
    ///
    /// Returns the first non-retryable failure unchanged. When every attempt
    /// fails with the retryable kind, returns the matching exhausted variant
    /// ([`CatalogError::ConnectionLost`] or
    /// [`CatalogError::SerializationConflict`]).
    pub async fn run<T, F, Fut>(&self, work: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_tries = self.max_tries.max(1);
        let mut attempt = 1;
        loop {
            match work().await {
                Ok(value) => return Ok(value),
                Err(err) if err.failure_kind() == Some(self.retry_on) => {
                    if attempt >= max_tries {
                        tracing::error!(
                            policy = self.name,
                            attempts = attempt,
                            error = %err,
                            "retry budget exhausted"
                        );
                        metrics::record_retry_exhausted(self.name);
                        return Err(self.exhausted(attempt, err));
                    }
                    tracing::warn!(
                        policy = self.name,
                        attempt,
                        max_tries,
                        error = %err,
                        "retrying catalog unit of work"
                    );
                    metrics::record_retry(self.name);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn exhausted(&self, attempts: u32, err: CatalogError) -> CatalogError {
        let CatalogError::Store(source) = err else {
            return err;
        };
        match self.retry_on {
            FailureKind::ConnectionLost => CatalogError::ConnectionLost { attempts, source },
            FailureKind::SerializationConflict => {
                CatalogError::SerializationConflict { attempts, source }
            }
            FailureKind::UniquenessViolation | FailureKind::Other => CatalogError::Store(source),
        }
    }
}

/// Runs units of work under the catalog's nested retry policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartableExecutor {
    reconnect: RetryPolicy,
    serialization: RetryPolicy,
}

impl RestartableExecutor {
    /// Creates an executor from explicit policies.
    #[must_use]
    pub const fn new(reconnect: RetryPolicy, serialization: RetryPolicy) -> Self {
        Self {
            reconnect,
            serialization,
        }
    }

    /// Creates an executor with the retry budgets from `config`.
    #[must_use]
    pub const fn from_config(config: &CatalogConfig) -> Self {
        Self::new(
            RetryPolicy::connection_loss(config.reconnect_tries),
            RetryPolicy::serialization_conflict(config.serialized_txn_tries),
        )
    }

    /// Runs read-committed work under the connection-loss policy only.
    ///
    /// # Errors
    ///
    /// See [`RetryPolicy::run`].
    pub async fn run<T, F, Fut>(&self, work: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.reconnect.run(work).await
    }

    /// Runs serializable work: connection-loss policy wrapping the
    /// serialization-conflict policy wrapping `work`.
    ///
    /// # Errors
    ///
    /// See [`RetryPolicy::run`].
    pub async fn run_serializable<T, F, Fut>(&self, work: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let work = &work;
        let serialization = &self.serialization;
        self.reconnect
            .run(move || serialization.run(work))
            .await
    }
}

impl Default for RestartableExecutor {
    fn default() -> Self {
        Self::from_config(&CatalogConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use quiver_core::store::StoreError;

    use super::*;

    fn failing(kind: FailureKind) -> CatalogError {
        CatalogError::Store(StoreError::new(kind, "injected"))
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let policy = RetryPolicy::serialization_conflict(3);
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let value = policy
            .run(move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(failing(FailureKind::SerializationConflict))
                } else {
                    Ok(42)
                }
            })
            .await
            .expect("third attempt succeeds");

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausting_budget_is_fatal() {
        let policy = RetryPolicy::serialization_conflict(3);
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let err = policy
            .run(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(failing(FailureKind::SerializationConflict))
            })
            .await
            .expect_err("budget exhausted");

        assert!(matches!(
            err,
            CatalogError::SerializationConflict { attempts: 3, .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_propagates_immediately() {
        let policy = RetryPolicy::connection_loss(5);
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let err = policy
            .run(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(failing(FailureKind::SerializationConflict))
            })
            .await
            .expect_err("not retried");

        assert_eq!(err.failure_kind(), Some(FailureKind::SerializationConflict));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_nested_policies_retry_independently() {
        let executor = RestartableExecutor::new(
            RetryPolicy::connection_loss(2),
            RetryPolicy::serialization_conflict(3),
        );
        let calls = AtomicU32::new(0);
        let calls = &calls;

        // conflict, conflict, connection lost, conflict, conflict, ok
        let value = executor
            .run_serializable(move || async move {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 | 3 | 4 => Err(failing(FailureKind::SerializationConflict)),
                    2 => Err(failing(FailureKind::ConnectionLost)),
                    _ => Ok("done"),
                }
            })
            .await
            .expect("both policies absorb their failures");

        assert_eq!(value, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_exhausted_inner_policy_is_not_retried_by_outer() {
        let executor = RestartableExecutor::new(
            RetryPolicy::connection_loss(5),
            RetryPolicy::serialization_conflict(2),
        );
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let err = executor
            .run_serializable(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(failing(FailureKind::SerializationConflict))
            })
            .await
            .expect_err("exhausted");

        assert!(err.is_exhausted());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_budget_still_runs_once() {
        let policy = RetryPolicy::connection_loss(0);
        let err = policy
            .run(|| async { Err::<(), _>(failing(FailureKind::ConnectionLost)) })
            .await
            .expect_err("fails");
        assert!(matches!(err, CatalogError::ConnectionLost { attempts: 1, .. }));
    }
}
