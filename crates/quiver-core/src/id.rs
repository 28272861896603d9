//! Strongly-typed identifiers for catalog entities.
//!
//! Array, version, query and instance identifiers are all 64-bit integers
//! on the wire. Wrapping them keeps an `ArrayId` from being passed where a
//! `VersionId` is expected.
//!
//! # Example
//!
//! ```rust
//! use quiver_core::id::{ArrayId, VersionId};
//!
//! let array = ArrayId::new(42);
//! assert!(array.is_valid());
//! assert_eq!(VersionId::NONE.get(), 0);
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wraps a raw identifier value.
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw identifier value.
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                s.parse::<u64>().map(Self).map_err(|e| {
                    Error::invalid_id(format!(concat!("invalid ", $label, " '{}': {}"), s, e))
                })
            }
        }
    };
}

numeric_id!(
    /// Identifies one catalog row in the array table.
    ///
    /// A base array has `uaid == id`; a version of it has `id > uaid`.
    /// Identifiers come from a cluster-wide counter and are never reused.
    ArrayId,
    "array id"
);

numeric_id!(
    /// Per-base-array version number, starting at 1.
    VersionId,
    "version id"
);

numeric_id!(
    /// Correlates every lock row belonging to one distributed query.
    QueryId,
    "query id"
);

numeric_id!(
    /// Identifies a cluster instance.
    InstanceId,
    "instance id"
);

impl ArrayId {
    /// The invalid array id (`0`).
    pub const INVALID: Self = Self(0);

    /// A catalog horizon that admits every array row.
    pub const MAX: Self = Self(0x7fff_ffff_ffff_ffff);

    /// Returns whether this id refers to a real catalog row.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0 && self.0 <= Self::MAX.0
    }
}

impl VersionId {
    /// "No versions yet".
    pub const NONE: Self = Self(0);

    /// Returns the version following this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl QueryId {
    /// The invalid query id (`0`).
    pub const INVALID: Self = Self(0);

    /// Returns whether this id refers to a real query.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_distinct_types() {
        let array = ArrayId::new(7);
        let version = VersionId::new(7);
        assert_eq!(array.get(), version.get());
        assert_eq!(array.to_string(), "7");
    }

    #[test]
    fn test_array_id_validity() {
        assert!(!ArrayId::INVALID.is_valid());
        assert!(ArrayId::new(1).is_valid());
        assert!(ArrayId::MAX.is_valid());
        assert!(!ArrayId::new(u64::MAX).is_valid());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!("12".parse::<QueryId>().expect("parse"), QueryId::new(12));
        let err = "twelve".parse::<QueryId>().expect_err("should fail");
        assert!(err.to_string().contains("invalid query id"));
    }

    #[test]
    fn test_serde_is_transparent() {
        let json = serde_json::to_string(&InstanceId::new(3)).expect("serialize");
        assert_eq!(json, "3");
    }

    #[test]
    fn test_version_next() {
        assert_eq!(VersionId::NONE.next(), VersionId::new(1));
    }
}
