//! The collection and cluster traits the transaction core is generic over.
//!
//! These are the seams between the protocol and a real client: a production
//! implementation wraps the network client, [`MemoryCluster`]
//! (`crate::memory`) implements them in-process for tests.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use atoll_core::Keyspace;

use crate::error::Result;
use crate::spec::{
    Cas, InsertOptions, LookupInOptions, LookupInResult, LookupInSpec, MutateInOptions,
    MutateInResult, MutateInSpec, MutationResult, RemoveOptions,
};

/// Result of a plain full-document read.
#[derive(Debug, Clone)]
pub struct GetResult {
    /// The document's current CAS.
    pub cas: Cas,
    /// The document body.
    pub content: Value,
}

/// A handle to one collection of documents.
///
/// All operations are atomic per document; `lookup_in`/`mutate_in` address
/// several sub-document paths in one atomic round trip.
#[async_trait]
pub trait KvCollection: Send + Sync {
    /// The coordinates of this collection.
    fn keyspace(&self) -> &Keyspace;

    /// Reads one or more paths (and optionally the body) atomically.
    async fn lookup_in(
        &self,
        id: &str,
        specs: &[LookupInSpec],
        options: LookupInOptions,
    ) -> Result<LookupInResult>;

    /// Applies one or more sub-document mutations atomically.
    async fn mutate_in(
        &self,
        id: &str,
        specs: &[MutateInSpec],
        options: MutateInOptions,
    ) -> Result<MutateInResult>;

    /// Creates a document; fails with `DocumentExists` if present.
    async fn insert(&self, id: &str, content: Value, options: InsertOptions)
    -> Result<MutationResult>;

    /// Deletes a document, leaving a tombstone.
    async fn remove(&self, id: &str, options: RemoveOptions) -> Result<MutationResult>;

    /// Reads the full document body. Tombstones read as not-found.
    async fn get(&self, id: &str) -> Result<GetResult>;

    /// Whether a live (non-tombstone) document exists.
    async fn exists(&self, id: &str) -> Result<bool>;
}

/// A handle to the cluster, resolving keyspaces to collection handles.
#[async_trait]
pub trait KvCluster: Send + Sync {
    /// Resolves a keyspace to a live collection handle.
    async fn collection(&self, keyspace: &Keyspace) -> Result<Arc<dyn KvCollection>>;
}
