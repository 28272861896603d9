//! Error types and result aliases shared by Quiver crates.

/// The result type used by `quiver-core`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by shared primitives.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier or code was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the identifier invalid.
        message: String,
    },

    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new invalid identifier error.
    #[must_use]
    pub fn invalid_id(message: impl Into<String>) -> Self {
        Self::InvalidId {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_display() {
        let err = Error::configuration("QUIVER_CATALOG_RECONNECT_TRIES must be positive");
        assert_eq!(
            err.to_string(),
            "configuration error: QUIVER_CATALOG_RECONNECT_TRIES must be positive"
        );
    }
}
