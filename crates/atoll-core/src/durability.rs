//! Durability levels for key-value mutations.
//!
//! A durability level is a requested replication/persistence guarantee
//! passed to the storage collaborator per mutation. The ATR records the
//! level an attempt ran with (short wire encoding) so that cleanup can
//! replay mutations at the same guarantee.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Requested replication/persistence guarantee for a mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurabilityLevel {
    /// No durability requirement beyond the active node's memory.
    None,
    /// Replicated to a majority of nodes.
    #[default]
    Majority,
    /// Replicated to a majority and persisted on the active node.
    MajorityAndPersistToActive,
    /// Persisted on a majority of nodes.
    PersistToMajority,
}

impl DurabilityLevel {
    /// Returns the short encoding stored in ATR entries.
    #[must_use]
    pub const fn as_short_str(&self) -> &'static str {
        match self {
            DurabilityLevel::None => "n",
            DurabilityLevel::Majority => "m",
            DurabilityLevel::MajorityAndPersistToActive => "pa",
            DurabilityLevel::PersistToMajority => "pm",
        }
    }

    /// Parses the short ATR encoding, defaulting to `Majority` for anything
    /// unrecognized (the safe side for replayed cleanup mutations).
    #[must_use]
    pub fn from_short_str(s: &str) -> Self {
        match s {
            "n" => DurabilityLevel::None,
            "pa" => DurabilityLevel::MajorityAndPersistToActive,
            "pm" => DurabilityLevel::PersistToMajority,
            _ => DurabilityLevel::Majority,
        }
    }
}

impl fmt::Display for DurabilityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_short_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_encoding_roundtrip() {
        for level in [
            DurabilityLevel::None,
            DurabilityLevel::Majority,
            DurabilityLevel::MajorityAndPersistToActive,
            DurabilityLevel::PersistToMajority,
        ] {
            assert_eq!(DurabilityLevel::from_short_str(level.as_short_str()), level);
        }
    }

    #[test]
    fn unknown_encoding_defaults_to_majority() {
        assert_eq!(
            DurabilityLevel::from_short_str("??"),
            DurabilityLevel::Majority
        );
    }
}
