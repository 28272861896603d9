//! Array lock modes and instance roles.
//!
//! Both enums persist as small integer codes in the lock table. Mode codes
//! are ordered so the lock predicates can compare them directly: every mode
//! stronger than [`LockMode::Rd`] conflicts with a writer.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The mode an array lock is held in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LockMode {
    /// Shared read.
    Rd,
    /// Write a new version of an existing array.
    Wr,
    /// Create a new array.
    Crt,
    /// Remove an array.
    Rm,
    /// Exclusive access.
    Xcl,
    /// Remove, tolerating a missing array.
    Rnf,
}

impl LockMode {
    /// Returns the persisted code for this mode.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Rd => 1,
            Self::Wr => 2,
            Self::Crt => 3,
            Self::Rm => 4,
            Self::Xcl => 5,
            Self::Rnf => 6,
        }
    }

    /// Decodes a persisted mode code.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidId`] for codes outside the known range.
    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            1 => Ok(Self::Rd),
            2 => Ok(Self::Wr),
            3 => Ok(Self::Crt),
            4 => Ok(Self::Rm),
            5 => Ok(Self::Xcl),
            6 => Ok(Self::Rnf),
            other => Err(Error::invalid_id(format!("unknown lock mode code {other}"))),
        }
    }

    /// Returns the short upper-case name used in logs and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rd => "RD",
            Self::Wr => "WR",
            Self::Crt => "CRT",
            Self::Rm => "RM",
            Self::Xcl => "XCL",
            Self::Rnf => "RNF",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The role an instance plays in a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceRole {
    /// The instance driving the query; owns the authoritative lock row.
    Coord,
    /// Any other participant; mirrors the coordinator's lock.
    Worker,
}

impl InstanceRole {
    /// Returns the persisted code for this role.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Coord => 1,
            Self::Worker => 2,
        }
    }

    /// Decodes a persisted role code.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidId`] for codes outside the known range.
    pub fn from_code(code: i64) -> Result<Self> {
        match code {
            1 => Ok(Self::Coord),
            2 => Ok(Self::Worker),
            other => Err(Error::invalid_id(format!("unknown instance role code {other}"))),
        }
    }

    /// Returns the short upper-case name used in logs and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Coord => "COORD",
            Self::Worker => "WORKER",
        }
    }
}

impl fmt::Display for InstanceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_order_matches_codes() {
        let modes = [
            LockMode::Rd,
            LockMode::Wr,
            LockMode::Crt,
            LockMode::Rm,
            LockMode::Xcl,
            LockMode::Rnf,
        ];
        for pair in modes.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].code() < pair[1].code());
        }
    }

    #[test]
    fn test_codes_decode() {
        assert_eq!(LockMode::from_code(5).expect("xcl"), LockMode::Xcl);
        assert!(LockMode::from_code(0).is_err());
        assert_eq!(InstanceRole::from_code(2).expect("worker"), InstanceRole::Worker);
        assert!(InstanceRole::from_code(3).is_err());
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&LockMode::Crt).expect("serialize");
        assert_eq!(json, "\"CRT\"");
        let role: InstanceRole = serde_json::from_str("\"COORD\"").expect("deserialize");
        assert_eq!(role, InstanceRole::Coord);
    }
}
