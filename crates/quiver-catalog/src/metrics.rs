//! Catalog metrics.
//!
//! Counters for retries and lock outcomes, plus transaction latency. These
//! complement the structured logging done at each call site.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_histogram, histogram};

// ============================================================================
// Retry Metrics
// ============================================================================

/// Retries absorbed by a retry policy.
pub const RETRY_TOTAL: &str = "quiver_catalog_retry_total";

/// Retry budgets exhausted.
pub const RETRY_EXHAUSTED_TOTAL: &str = "quiver_catalog_retry_exhausted_total";

// ============================================================================
// Lock and Version Metrics
// ============================================================================

/// Array lock acquisition outcomes.
pub const LOCK_OUTCOME_TOTAL: &str = "quiver_lock_outcome_total";

/// Array versions created.
pub const VERSIONS_CREATED_TOTAL: &str = "quiver_array_versions_created_total";

// ============================================================================
// Transaction Metrics
// ============================================================================

/// Catalog transaction duration.
pub const TXN_DURATION: &str = "quiver_catalog_txn_duration_seconds";

static METRICS_REGISTERED: OnceLock<()> = OnceLock::new();

/// Registers all catalog metric descriptions.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn register_metrics() {
    METRICS_REGISTERED.get_or_init(|| {
        describe_counter!(RETRY_TOTAL, "Total retries absorbed by catalog retry policies");
        describe_counter!(
            RETRY_EXHAUSTED_TOTAL,
            "Total catalog operations that exhausted a retry budget"
        );
        describe_counter!(LOCK_OUTCOME_TOTAL, "Array lock acquisition outcomes");
        describe_counter!(VERSIONS_CREATED_TOTAL, "Total array versions created");
        describe_histogram!(TXN_DURATION, "Duration of catalog transactions in seconds");
    });
}

/// Records a retry absorbed by the named policy.
pub fn record_retry(policy: &'static str) {
    counter!(RETRY_TOTAL, "policy" => policy).increment(1);
}

/// Records an exhausted retry budget.
pub fn record_retry_exhausted(policy: &'static str) {
    counter!(RETRY_EXHAUSTED_TOTAL, "policy" => policy).increment(1);
}

/// Records the outcome of one lock acquisition attempt.
pub fn record_lock_outcome(mode: &'static str, role: &'static str, outcome: &'static str) {
    counter!(
        LOCK_OUTCOME_TOTAL,
        "mode" => mode,
        "role" => role,
        "outcome" => outcome,
    )
    .increment(1);
}

/// Records a new array version.
pub fn record_version_created() {
    counter!(VERSIONS_CREATED_TOTAL).increment(1);
}

/// Records the duration of a finished transaction.
pub fn record_txn_duration(isolation: &'static str, committed: bool, duration_secs: f64) {
    let outcome = if committed { "commit" } else { "rollback" };
    histogram!(TXN_DURATION, "isolation" => isolation, "outcome" => outcome).record(duration_secs);
}
