//! Keyspace coordinates: weak references to collections and documents.
//!
//! A transaction attempt touches documents spread across buckets, scopes and
//! collections. Rather than holding live connection handles, the protocol
//! records plain coordinates and resolves them lazily through the cluster
//! when (and if) they are needed; a cleanup request may outlive the
//! connection that produced it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CoreError, Result};

/// Location of a collection: `(bucket, scope, collection)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Keyspace {
    /// Bucket name.
    pub bucket: String,
    /// Scope name.
    pub scope: String,
    /// Collection name.
    pub collection: String,
}

impl Keyspace {
    /// Creates a keyspace from its three coordinates.
    #[must_use]
    pub fn new(
        bucket: impl Into<String>,
        scope: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            scope: scope.into(),
            collection: collection.into(),
        }
    }

    /// Creates a keyspace addressing a bucket's default scope/collection.
    #[must_use]
    pub fn default_collection(bucket: impl Into<String>) -> Self {
        Self::new(bucket, "_default", "_default")
    }
}

impl fmt::Display for Keyspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.bucket, self.scope, self.collection)
    }
}

impl FromStr for Keyspace {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(bucket), Some(scope), Some(collection), None)
                if !bucket.is_empty() && !scope.is_empty() && !collection.is_empty() =>
            {
                Ok(Self::new(bucket, scope, collection))
            }
            _ => Err(CoreError::invalid_keyspace(format!(
                "expected 'bucket/scope/collection', got '{s}'"
            ))),
        }
    }
}

/// Identifies one document touched by a transaction attempt.
///
/// A `DocRecord` does not own the document; it is a weak reference by
/// coordinates, resolved to a live collection handle only when acted on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocRecord {
    /// Where the document lives.
    pub keyspace: Keyspace,
    /// The document id (key).
    pub id: String,
}

impl DocRecord {
    /// Creates a document record.
    #[must_use]
    pub fn new(keyspace: Keyspace, id: impl Into<String>) -> Self {
        Self {
            keyspace,
            id: id.into(),
        }
    }
}

impl fmt::Display for DocRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.keyspace, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyspace_display_and_parse() {
        let ks = Keyspace::new("travel", "inventory", "hotels");
        assert_eq!(ks.to_string(), "travel/inventory/hotels");
        assert_eq!("travel/inventory/hotels".parse::<Keyspace>().unwrap(), ks);
    }

    #[test]
    fn keyspace_rejects_malformed() {
        assert!("travel".parse::<Keyspace>().is_err());
        assert!("a/b".parse::<Keyspace>().is_err());
        assert!("a/b/c/d".parse::<Keyspace>().is_err());
        assert!("a//c".parse::<Keyspace>().is_err());
    }

    #[test]
    fn doc_record_display() {
        let dr = DocRecord::new(Keyspace::default_collection("main"), "order::17");
        assert_eq!(dr.to_string(), "main/_default/_default/order::17");
    }
}
