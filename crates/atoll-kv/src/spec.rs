//! Sub-document operation specs, options and results.
//!
//! A lookup or mutation addresses one or more paths inside a document in a
//! single atomic round trip. Paths are dotted (`txn.atr_id`,
//! `attempts.<attempt-id>.st`) and may be scoped to the xattr namespace:
//! hidden metadata living outside the document body.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;

use atoll_core::DurabilityLevel;

use crate::error::{KvError, Result};

/// Opaque compare-and-swap version token. Changes on every mutation.
pub type Cas = u64;

/// A value to expand server-side at mutation time.
///
/// Macro expansion records server-generated values (the mutation's own CAS,
/// the post-mutation value checksum) without a second round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationMacro {
    /// Expands to the CAS assigned by this mutation, as a hex string.
    /// Doubles as a coarse timestamp: CAS values are hybrid logical clocks.
    Cas,
    /// Expands to the CRC32-C of the document value after this mutation,
    /// as a hex string matching `$document.value_crc32c`.
    ValueCrc32c,
}

/// A literal or macro value carried by a mutation spec.
#[derive(Debug, Clone, PartialEq)]
pub enum MutateValue {
    /// A literal JSON value.
    Value(Value),
    /// A server-side macro expanded at mutation time.
    Macro(MutationMacro),
}

impl From<Value> for MutateValue {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<MutationMacro> for MutateValue {
    fn from(m: MutationMacro) -> Self {
        Self::Macro(m)
    }
}

/// One path read inside a [`lookup_in`](crate::KvCollection::lookup_in) call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupInSpec {
    /// Read the value at a path.
    Get {
        /// Dotted path to read.
        path: String,
        /// Whether the path is in the xattr namespace.
        xattr: bool,
    },
    /// Read the full document body.
    GetFull,
}

impl LookupInSpec {
    /// Reads the value at `path`.
    #[must_use]
    pub fn get(path: impl Into<String>, xattr: bool) -> Self {
        Self::Get {
            path: path.into(),
            xattr,
        }
    }

    /// Reads the full document body.
    #[must_use]
    pub const fn get_full() -> Self {
        Self::GetFull
    }
}

/// The sub-document operation a [`MutateInSpec`] performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubdocOp {
    /// Create the path; fails with `PathExists` if it already exists.
    Insert,
    /// Create or overwrite the path.
    Upsert,
    /// Remove the path; fails with `PathNotFound` if absent.
    Remove,
    /// Replace the entire document body.
    SetDoc,
}

/// One mutation applied inside a [`mutate_in`](crate::KvCollection::mutate_in)
/// call. All specs in a call apply atomically or not at all.
#[derive(Debug, Clone, PartialEq)]
pub struct MutateInSpec {
    /// The operation to perform.
    pub op: SubdocOp,
    /// Dotted path the operation addresses (empty for `SetDoc`).
    pub path: String,
    /// The value written (`None` for `Remove`).
    pub value: Option<MutateValue>,
    /// Whether the path is in the xattr namespace.
    pub xattr: bool,
    /// Whether missing intermediate path segments are created.
    pub create_path: bool,
}

impl MutateInSpec {
    /// Creates an `Insert` spec at `path`.
    #[must_use]
    pub fn insert(path: impl Into<String>, value: impl Into<MutateValue>) -> Self {
        Self {
            op: SubdocOp::Insert,
            path: path.into(),
            value: Some(value.into()),
            xattr: false,
            create_path: false,
        }
    }

    /// Creates an `Upsert` spec at `path`.
    #[must_use]
    pub fn upsert(path: impl Into<String>, value: impl Into<MutateValue>) -> Self {
        Self {
            op: SubdocOp::Upsert,
            path: path.into(),
            value: Some(value.into()),
            xattr: false,
            create_path: false,
        }
    }

    /// Creates a `Remove` spec at `path`.
    #[must_use]
    pub fn remove(path: impl Into<String>) -> Self {
        Self {
            op: SubdocOp::Remove,
            path: path.into(),
            value: None,
            xattr: false,
            create_path: false,
        }
    }

    /// Creates a `SetDoc` spec replacing the whole body.
    #[must_use]
    pub fn set_doc(value: impl Into<MutateValue>) -> Self {
        Self {
            op: SubdocOp::SetDoc,
            path: String::new(),
            value: Some(value.into()),
            xattr: false,
            create_path: false,
        }
    }

    /// Scopes the spec to the xattr namespace.
    #[must_use]
    pub fn xattr(mut self) -> Self {
        self.xattr = true;
        self
    }

    /// Creates missing intermediate path segments.
    #[must_use]
    pub fn create_path(mut self) -> Self {
        self.create_path = true;
        self
    }
}

/// How a mutation treats the document as a whole.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StoreSemantics {
    /// The document must already exist.
    #[default]
    Replace,
    /// The document is created if missing.
    Upsert,
    /// The document must not exist.
    Insert,
}

/// Options for a sub-document lookup.
#[derive(Debug, Clone, Default)]
pub struct LookupInOptions {
    /// Read tombstones (deleted documents whose xattrs survive) as well.
    pub access_deleted: bool,
    /// Per-operation timeout.
    pub timeout: Option<Duration>,
}

impl LookupInOptions {
    /// Enables tombstone access.
    #[must_use]
    pub fn with_access_deleted(mut self) -> Self {
        self.access_deleted = true;
        self
    }

    /// Sets the per-operation timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Options for a sub-document mutation.
#[derive(Debug, Clone, Default)]
pub struct MutateInOptions {
    /// Required current CAS; mismatch fails with [`KvError::CasMismatch`].
    pub cas: Option<Cas>,
    /// Requested durability for the mutation.
    pub durability: DurabilityLevel,
    /// Whole-document semantics.
    pub store_semantics: StoreSemantics,
    /// Operate on tombstones as well.
    pub access_deleted: bool,
    /// When creating the document, create it as a tombstone (xattrs only,
    /// no visible body). This is how staged inserts stay invisible until commit.
    pub create_as_deleted: bool,
    /// Per-operation timeout.
    pub timeout: Option<Duration>,
}

impl MutateInOptions {
    /// Requires the document's current CAS to match.
    #[must_use]
    pub fn with_cas(mut self, cas: Cas) -> Self {
        self.cas = Some(cas);
        self
    }

    /// Sets the requested durability.
    #[must_use]
    pub fn with_durability(mut self, durability: DurabilityLevel) -> Self {
        self.durability = durability;
        self
    }

    /// Sets the whole-document semantics.
    #[must_use]
    pub fn with_store_semantics(mut self, semantics: StoreSemantics) -> Self {
        self.store_semantics = semantics;
        self
    }

    /// Enables tombstone access.
    #[must_use]
    pub fn with_access_deleted(mut self) -> Self {
        self.access_deleted = true;
        self
    }

    /// Creates the document as a tombstone when it does not exist.
    #[must_use]
    pub fn with_create_as_deleted(mut self) -> Self {
        self.create_as_deleted = true;
        self
    }

    /// Sets the per-operation timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Options for a full-document insert.
#[derive(Debug, Clone, Default)]
pub struct InsertOptions {
    /// Requested durability for the insert.
    pub durability: DurabilityLevel,
    /// Per-operation timeout.
    pub timeout: Option<Duration>,
}

impl InsertOptions {
    /// Sets the requested durability.
    #[must_use]
    pub fn with_durability(mut self, durability: DurabilityLevel) -> Self {
        self.durability = durability;
        self
    }

    /// Sets the per-operation timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Options for a full-document remove.
#[derive(Debug, Clone, Default)]
pub struct RemoveOptions {
    /// Required current CAS; mismatch fails with [`KvError::CasMismatch`].
    pub cas: Option<Cas>,
    /// Requested durability for the remove.
    pub durability: DurabilityLevel,
    /// Per-operation timeout.
    pub timeout: Option<Duration>,
}

impl RemoveOptions {
    /// Requires the document's current CAS to match.
    #[must_use]
    pub fn with_cas(mut self, cas: Cas) -> Self {
        self.cas = Some(cas);
        self
    }

    /// Sets the requested durability.
    #[must_use]
    pub fn with_durability(mut self, durability: DurabilityLevel) -> Self {
        self.durability = durability;
        self
    }

    /// Sets the per-operation timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Result of a sub-document lookup.
#[derive(Debug, Clone)]
pub struct LookupInResult {
    /// The document's current CAS.
    pub cas: Cas,
    /// Whether the document is a tombstone.
    pub tombstone: bool,
    fields: Vec<Option<Value>>,
}

impl LookupInResult {
    /// Builds a result from per-spec fields (`None` = path absent).
    #[must_use]
    pub fn new(cas: Cas, tombstone: bool, fields: Vec<Option<Value>>) -> Self {
        Self {
            cas,
            tombstone,
            fields,
        }
    }

    /// Whether the path addressed by spec `index` existed.
    #[must_use]
    pub fn exists(&self, index: usize) -> bool {
        self.fields.get(index).is_some_and(Option::is_some)
    }

    /// The raw value at spec `index`, if present.
    #[must_use]
    pub fn content(&self, index: usize) -> Option<&Value> {
        self.fields.get(index).and_then(Option::as_ref)
    }

    /// Deserializes the value at spec `index`.
    ///
    /// # Errors
    ///
    /// `PathNotFound` if the field was absent, `Internal` if it does not
    /// deserialize into `T`.
    pub fn content_as<T: DeserializeOwned>(&self, index: usize) -> Result<T> {
        let value = self
            .content(index)
            .ok_or_else(|| KvError::path_not_found(format!("lookup field {index}")))?;
        serde_json::from_value(value.clone())
            .map_err(|e| KvError::internal(format!("lookup field {index} failed to decode: {e}")))
    }
}

/// Token identifying a mutation's position in the document's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationToken {
    /// Sequence number of the mutation on its vbucket. A zero value means
    /// the mutation was a no-op (nothing actually changed).
    pub sequence_number: u64,
}

/// Result of a sub-document mutation.
#[derive(Debug, Clone, Copy)]
pub struct MutateInResult {
    /// The document's new CAS.
    pub cas: Cas,
    /// The mutation's token.
    pub token: MutationToken,
}

/// Result of a full-document insert/remove.
#[derive(Debug, Clone, Copy)]
pub struct MutationResult {
    /// The document's new CAS (the tombstone's CAS for removes).
    pub cas: Cas,
}
