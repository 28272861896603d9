//! Catalog error types.
//!
//! Callers see a small set of typed failures. Transient store failures that
//! exhausted their retry budget ([`CatalogError::ConnectionLost`],
//! [`CatalogError::SerializationConflict`]) are kept apart from permanent
//! ones, and [`CatalogError::LockBusy`] is an expected outcome rather than a
//! fault.

use std::fmt;

use quiver_core::store::{FailureKind, StoreError};

/// The result type used throughout the catalog.
pub type Result<T> = std::result::Result<T, CatalogError>;

/// Errors raised by catalog operations.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// A store failure that was not absorbed by a retry policy.
    #[error("catalog store error: {0}")]
    Store(#[from] StoreError),

    /// The store connection kept dropping until the retry budget ran out.
    #[error("lost connection to the catalog store after {attempts} attempts: {source}")]
    ConnectionLost {
        /// Attempts made before giving up.
        attempts: u32,
        /// The last failure observed.
        #[source]
        source: StoreError,
    },

    /// Serializable transactions kept conflicting until the retry budget ran out.
    #[error("catalog transaction could not be serialized after {attempts} attempts: {source}")]
    SerializationConflict {
        /// Attempts made before giving up.
        attempts: u32,
        /// The last failure observed.
        #[source]
        source: StoreError,
    },

    /// The object being created already exists.
    #[error("{resource} '{name}' already exists")]
    AlreadyExists {
        /// Kind of object.
        resource: &'static str,
        /// Its name or id.
        name: String,
    },

    /// The referenced object does not exist.
    #[error("{resource} not found: {id}")]
    NotFound {
        /// Kind of object.
        resource: &'static str,
        /// The name or id that was looked up.
        id: String,
    },

    /// The lock manager was asked for an invalid mode/role combination, or a
    /// worker tried to acquire a lock it already holds.
    #[error("array lock protocol violation: {message}")]
    ProtocolViolation {
        /// Description of the violation.
        message: String,
    },

    /// A conflicting lock is held by another query; try again later.
    #[error("array '{array_name}' is locked by another query")]
    LockBusy {
        /// The array that could not be locked.
        array_name: String,
    },

    /// An array descriptor failed validation.
    #[error("invalid array descriptor: {message}")]
    InvalidDescriptor {
        /// Description of the problem.
        message: String,
    },

    /// A caller passed an argument the operation cannot accept.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },

    /// No authorization extension is installed to serve this call.
    #[error("authorization extension unavailable for {operation}")]
    ExtensionUnavailable {
        /// The operation that needed the extension.
        operation: &'static str,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal catalog error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl CatalogError {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(resource: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    /// Creates an already-exists error.
    #[must_use]
    pub fn already_exists(resource: &'static str, name: impl fmt::Display) -> Self {
        Self::AlreadyExists {
            resource,
            name: name.to_string(),
        }
    }

    /// Creates a protocol violation error.
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            message: message.into(),
        }
    }

    /// Creates an invalid descriptor error.
    #[must_use]
    pub fn invalid_descriptor(message: impl Into<String>) -> Self {
        Self::InvalidDescriptor {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns the store classification of an unabsorbed store failure.
    ///
    /// Only [`CatalogError::Store`] carries a kind: exhausted retries are
    /// final and must not be retried again by an enclosing policy.
    #[must_use]
    pub const fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Store(e) => Some(e.kind()),
            _ => None,
        }
    }

    /// Returns whether this failure is transient and was already retried to
    /// exhaustion.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost { .. } | Self::SerializationConflict { .. }
        )
    }

    /// Returns whether this is a uniqueness violation reported by the store.
    #[must_use]
    pub fn is_uniqueness_violation(&self) -> bool {
        self.failure_kind() == Some(FailureKind::UniquenessViolation)
    }
}

impl From<quiver_core::Error> for CatalogError {
    fn from(err: quiver_core::Error) -> Self {
        match err {
            quiver_core::Error::InvalidId { message } => Self::InvalidArgument { message },
            other => Self::internal(other.to_string()),
        }
    }
}
