//! Strongly-typed identifiers for Atoll entities.
//!
//! All identifiers are:
//! - **Strongly typed**: Prevents mixing up different id types at compile time
//! - **Globally unique**: No coordination required for generation
//! - **Wire-stable**: The hyphenated UUID text form is what lands in xattrs
//!   and ATR entries, so other clients can parse it
//!
//! # Example
//!
//! ```rust
//! use atoll_core::id::{AttemptId, TransactionId};
//!
//! let txn = TransactionId::generate();
//! let attempt = AttemptId::generate();
//!
//! // Ids are different types - this won't compile:
//! // let wrong: TransactionId = attempt;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// A unique identifier for a logical transaction.
///
/// Stable across every attempt (retry) of the same transaction, so an
/// observer can correlate retries in the ATR and in document xattrs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Generates a new unique transaction id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a transaction id from a raw UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransactionId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| CoreError::invalid_id(format!("invalid transaction id '{s}': {e}")))
    }
}

/// A unique identifier for one attempt at executing a transaction.
///
/// Each retry of a transaction gets a fresh attempt id. The attempt id is
/// the staging ownership token: a document whose staging `ver` xattr carries
/// this id belongs to this attempt and no other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptId(Uuid);

impl AttemptId {
    /// Generates a new unique attempt id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an attempt id from a raw UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AttemptId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| CoreError::invalid_id(format!("invalid attempt id '{s}': {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_id_roundtrip() {
        let id = TransactionId::generate();
        let s = id.to_string();
        let parsed: TransactionId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn attempt_id_roundtrip() {
        let id = AttemptId::generate();
        let s = id.to_string();
        let parsed: AttemptId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn ids_are_unique() {
        let a = AttemptId::generate();
        let b = AttemptId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn serde_is_transparent() {
        let id = AttemptId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }
}
