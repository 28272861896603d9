//! Catalog configuration.
//!
//! Retry budgets and lock backoff timing, loaded from the environment with
//! strict validation. Every value must be a positive integer when set.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const ENV_RECONNECT_TRIES: &str = "QUIVER_CATALOG_RECONNECT_TRIES";
const ENV_SERIALIZED_TXN_TRIES: &str = "QUIVER_CATALOG_SERIALIZED_TXN_TRIES";
const ENV_LOCK_RETRY_BASE_MS: &str = "QUIVER_CATALOG_LOCK_RETRY_BASE_MS";
const ENV_LOCK_RETRY_MAX_MS: &str = "QUIVER_CATALOG_LOCK_RETRY_MAX_MS";

/// Default number of attempts when the store connection drops.
pub const DEFAULT_RECONNECT_TRIES: u32 = 5;

/// Default number of attempts when a serializable transaction conflicts.
pub const DEFAULT_SERIALIZED_TXN_TRIES: u32 = 10;

const DEFAULT_LOCK_RETRY_BASE_MS: u64 = 10;
const DEFAULT_LOCK_RETRY_MAX_MS: u64 = 1_000;

/// Configuration for a catalog instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CatalogConfig {
    /// Attempts made by the connection-loss retry policy.
    pub reconnect_tries: u32,
    /// Attempts made by the serialization-conflict retry policy.
    pub serialized_txn_tries: u32,
    /// First delay between busy lock attempts, in milliseconds.
    pub lock_retry_base_ms: u64,
    /// Cap on the delay between busy lock attempts, in milliseconds.
    pub lock_retry_max_ms: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            reconnect_tries: DEFAULT_RECONNECT_TRIES,
            serialized_txn_tries: DEFAULT_SERIALIZED_TXN_TRIES,
            lock_retry_base_ms: DEFAULT_LOCK_RETRY_BASE_MS,
            lock_retry_max_ms: DEFAULT_LOCK_RETRY_MAX_MS,
        }
    }
}

impl CatalogConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a value is not a positive integer.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads configuration with a custom environment source.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a value is not a positive integer,
    /// or when the lock retry base delay exceeds the maximum.
    pub fn from_env_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let reconnect_tries = parse_positive_u32_env(
            &get_env,
            ENV_RECONNECT_TRIES,
            DEFAULT_RECONNECT_TRIES,
        )?;
        let serialized_txn_tries = parse_positive_u32_env(
            &get_env,
            ENV_SERIALIZED_TXN_TRIES,
            DEFAULT_SERIALIZED_TXN_TRIES,
        )?;
        let lock_retry_base_ms =
            parse_positive_u64_env(&get_env, ENV_LOCK_RETRY_BASE_MS, DEFAULT_LOCK_RETRY_BASE_MS)?;
        let lock_retry_max_ms =
            parse_positive_u64_env(&get_env, ENV_LOCK_RETRY_MAX_MS, DEFAULT_LOCK_RETRY_MAX_MS)?;

        if lock_retry_base_ms > lock_retry_max_ms {
            return Err(Error::configuration(format!(
                "{ENV_LOCK_RETRY_BASE_MS} ({lock_retry_base_ms}) exceeds {ENV_LOCK_RETRY_MAX_MS} ({lock_retry_max_ms})"
            )));
        }

        Ok(Self {
            reconnect_tries,
            serialized_txn_tries,
            lock_retry_base_ms,
            lock_retry_max_ms,
        })
    }

    /// Sets the connection-loss retry budget.
    #[must_use]
    pub const fn with_reconnect_tries(mut self, tries: u32) -> Self {
        self.reconnect_tries = tries;
        self
    }

    /// Sets the serialization-conflict retry budget.
    #[must_use]
    pub const fn with_serialized_txn_tries(mut self, tries: u32) -> Self {
        self.serialized_txn_tries = tries;
        self
    }

    /// Sets the busy-lock backoff window.
    #[must_use]
    pub const fn with_lock_retry(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.lock_retry_base_ms = base_ms;
        self.lock_retry_max_ms = max_ms;
        self
    }

    /// First delay between busy lock attempts.
    #[must_use]
    pub const fn lock_retry_base(&self) -> Duration {
        Duration::from_millis(self.lock_retry_base_ms)
    }

    /// Cap on the delay between busy lock attempts.
    #[must_use]
    pub const fn lock_retry_max(&self) -> Duration {
        Duration::from_millis(self.lock_retry_max_ms)
    }
}

fn parse_positive_u64_env<F>(get_env: &F, key: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(default);
    };

    let parsed = raw.trim().parse::<u64>().map_err(|_| {
        Error::configuration(format!("{key} must be a positive integer, got '{raw}'"))
    })?;
    if parsed == 0 {
        return Err(Error::configuration(format!(
            "{key} must be a positive integer, got '{raw}'"
        )));
    }
    Ok(parsed)
}

fn parse_positive_u32_env<F>(get_env: &F, key: &str, default: u32) -> Result<u32>
where
    F: Fn(&str) -> Option<String>,
{
    let parsed = parse_positive_u64_env(get_env, key, u64::from(default))?;
    u32::try_from(parsed).map_err(|_| {
        Error::configuration(format!("{key} value {parsed} exceeds supported range"))
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_when_unset() {
        let cfg = CatalogConfig::from_env_with(|_| None).expect("defaults");
        assert_eq!(cfg, CatalogConfig::default());
        assert_eq!(cfg.reconnect_tries, 5);
        assert_eq!(cfg.serialized_txn_tries, 10);
    }

    #[test]
    fn test_overrides_from_env() {
        let vars = vars(&[
            (ENV_RECONNECT_TRIES, "3"),
            (ENV_SERIALIZED_TXN_TRIES, "25"),
            (ENV_LOCK_RETRY_BASE_MS, "5"),
            (ENV_LOCK_RETRY_MAX_MS, "50"),
        ]);
        let cfg = CatalogConfig::from_env_with(|key| vars.get(key).cloned()).expect("config");
        assert_eq!(cfg.reconnect_tries, 3);
        assert_eq!(cfg.serialized_txn_tries, 25);
        assert_eq!(cfg.lock_retry_base(), Duration::from_millis(5));
        assert_eq!(cfg.lock_retry_max(), Duration::from_millis(50));
    }

    #[test]
    fn test_rejects_zero_and_garbage() {
        let zero = vars(&[(ENV_SERIALIZED_TXN_TRIES, "0")]);
        let err = CatalogConfig::from_env_with(|key| zero.get(key).cloned())
            .expect_err("zero must fail");
        assert!(err.to_string().contains(ENV_SERIALIZED_TXN_TRIES));

        let garbage = vars(&[(ENV_RECONNECT_TRIES, "many")]);
        assert!(CatalogConfig::from_env_with(|key| garbage.get(key).cloned()).is_err());
    }

    #[test]
    fn test_rejects_base_above_max() {
        let vars = vars(&[(ENV_LOCK_RETRY_BASE_MS, "500"), (ENV_LOCK_RETRY_MAX_MS, "100")]);
        assert!(CatalogConfig::from_env_with(|key| vars.get(key).cloned()).is_err());
    }

    #[test]
    fn test_deserialize_partial_uses_defaults() {
        let cfg: CatalogConfig =
            serde_json::from_str(r#"{"serializedTxnTries": 4}"#).expect("deserialize");
        assert_eq!(cfg.serialized_txn_tries, 4);
        assert_eq!(cfg.reconnect_tries, DEFAULT_RECONNECT_TRIES);
    }
}
