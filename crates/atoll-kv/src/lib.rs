//! # atoll-kv
//!
//! The narrow key-value contract the Atoll transaction core consumes from
//! its storage collaborator:
//!
//! - **Sub-document lookups**: body plus `txn.*` xattrs read atomically
//! - **Sub-document mutations**: xattr-scoped insert/upsert/remove with
//!   CAS preconditions, durability levels, tombstone access, and
//!   server-side macro expansion
//! - **Full-document insert/remove** for final document creation/deletion
//!
//! The contract is expressed as object-safe traits ([`KvCollection`],
//! [`KvCluster`]) so the transaction layer never depends on a concrete
//! client. [`MemoryCluster`] implements the full contract in-process for
//! hermetic tests.
//!
//! ## CAS
//!
//! Every document carries an opaque version token ([`Cas`]) that changes on
//! each mutation. Mutations taking a `cas` option fail with
//! [`KvError::CasMismatch`] when the document has moved. This is the sole
//! optimistic-concurrency primitive the transaction protocol builds on.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]

pub mod collection;
pub mod error;
pub mod memory;
pub mod spec;

pub use collection::{GetResult, KvCluster, KvCollection};
pub use error::{KvError, Result};
pub use memory::MemoryCluster;
pub use spec::{
    Cas, InsertOptions, LookupInOptions, LookupInResult, LookupInSpec, MutateInOptions,
    MutateInResult, MutateInSpec, MutateValue, MutationMacro, MutationResult, MutationToken,
    RemoveOptions, StoreSemantics,
};

/// Virtual xattr path exposing document metadata (`cas`, `value_crc32c`, ...).
pub const DOCUMENT_METADATA_XATTR: &str = "$document";
