//! Logging initialisation and span helpers.
//!
//! Structured logging with consistent spans across catalog components.

use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::id::{InstanceId, QueryId};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Safe to call multiple times; subsequent calls are no-ops. Levels come
/// from `RUST_LOG` (e.g. `info`, `quiver_catalog=debug`), defaulting to `info`.
///
/// # Example
///
/// ```rust
/// use quiver_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for a catalog operation.
#[must_use]
pub fn catalog_span(operation: &str) -> Span {
    tracing::info_span!("catalog", op = operation)
}

/// Creates a span for an array lock operation.
///
/// # Example
///
/// ```rust
/// use quiver_core::id::{InstanceId, QueryId};
/// use quiver_core::observability::lock_span;
///
/// let span = lock_span("lock_array", "A", QueryId::new(1), InstanceId::new(0));
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn lock_span(operation: &str, array_name: &str, query_id: QueryId, instance_id: InstanceId) -> Span {
    tracing::info_span!(
        "array_lock",
        op = operation,
        array = array_name,
        query_id = query_id.get(),
        instance_id = instance_id.get(),
    )
}
