//! Staged-document access: the one-lookup read and the staging/unstaging
//! mutations the protocol performs on application documents.
//!
//! Every read fetches the body and the `txn.*` xattrs in a single
//! sub-document lookup so concurrent staging is visible atomically with the
//! body. Every staging write goes through the document's current CAS.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};

use atoll_core::{AttemptId, DurabilityLevel, Keyspace, TransactionId};
use atoll_kv::{
    Cas, DOCUMENT_METADATA_XATTR, InsertOptions, KvCollection, LookupInOptions, LookupInSpec,
    MutateInOptions, MutateInResult, MutateInSpec, MutationMacro, RemoveOptions, StoreSemantics,
};

use crate::error::Result;
use crate::fields;

/// A document's transaction xattrs (the `txn` tree, staged content aside).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransactionXattrs {
    /// Transaction id that owns the staging metadata.
    #[serde(rename = "id")]
    pub transaction_id: Option<String>,
    /// Id of the coordinating ATR document.
    pub atr_id: Option<String>,
    /// Bucket of the coordinating ATR document.
    #[serde(rename = "atr_bkt")]
    pub atr_bucket: Option<String>,
    /// Scope of the coordinating ATR document.
    #[serde(rename = "atr_scp")]
    pub atr_scope: Option<String>,
    /// Collection of the coordinating ATR document.
    #[serde(rename = "atr_coll")]
    pub atr_collection: Option<String>,
    /// Staging version: the attempt id owning the staged write.
    #[serde(rename = "ver")]
    pub staging_version: Option<String>,
    /// Value checksum recorded at staging time.
    pub crc32: Option<String>,
}

impl TransactionXattrs {
    /// Whether the staging metadata is owned by `attempt_id`.
    #[must_use]
    pub fn owned_by(&self, attempt_id: &AttemptId) -> bool {
        self.staging_version.as_deref() == Some(attempt_id.to_string().as_str())
    }

    /// Coordinates of the ATR document, when fully recorded.
    #[must_use]
    pub fn atr_keyspace(&self) -> Option<Keyspace> {
        Some(Keyspace::new(
            self.atr_bucket.clone()?,
            self.atr_scope.clone()?,
            self.atr_collection.clone()?,
        ))
    }
}

/// Document metadata from the `$document` virtual xattr.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DocumentMetadata {
    /// Current CAS, as the store's hex string form.
    #[serde(rename = "CAS")]
    pub cas: Option<String>,
    /// Expiry time, seconds since epoch (0 = none).
    pub exptime: Option<u64>,
    /// CRC32-C of the current document value.
    #[serde(rename = "value_crc32c")]
    pub crc32c: Option<String>,
}

/// Result of the protocol's one-lookup document read.
#[derive(Debug, Clone)]
pub struct DocumentLookup {
    /// The document id.
    pub id: String,
    /// The document's current CAS.
    pub cas: Cas,
    /// Whether the document is currently a tombstone.
    pub is_tombstone: bool,
    /// The visible body, when requested and present.
    pub body: Option<Value>,
    /// Staged content (`txn.staged`), possibly the removal sentinel.
    pub staged_content: Option<Value>,
    /// The `txn` xattr tree, absent when no attempt has staged here.
    pub txn: Option<TransactionXattrs>,
    /// `$document` metadata.
    pub metadata: Option<DocumentMetadata>,
}

impl DocumentLookup {
    /// Whether the staged content is the removal sentinel.
    #[must_use]
    pub fn staged_as_removal(&self) -> bool {
        self.staged_content.as_ref().and_then(Value::as_str) == Some(fields::REMOVED_SENTINEL)
    }
}

/// Reads a document's body and transaction xattrs in one atomic lookup.
///
/// Tombstones are readable (their staging xattrs are the whole point); a
/// document with no entry at all yields `KvError::DocumentNotFound`.
///
/// # Errors
///
/// Propagates collaborator failures.
pub async fn lookup_document(
    collection: &dyn KvCollection,
    id: &str,
    kv_timeout: Option<Duration>,
    full_document: bool,
) -> Result<DocumentLookup> {
    let mut specs = vec![
        LookupInSpec::get(fields::TXN_PREFIX, true),
        LookupInSpec::get(DOCUMENT_METADATA_XATTR, true),
        LookupInSpec::get(fields::TXN_STAGED_DATA, true),
    ];
    if full_document {
        specs.push(LookupInSpec::get_full());
    }

    let result = collection
        .lookup_in(
            id,
            &specs,
            LookupInOptions::default()
                .with_access_deleted()
                .with_timeout(kv_timeout),
        )
        .await?;

    let txn = if result.exists(0) {
        Some(result.content_as::<TransactionXattrs>(0)?)
    } else {
        None
    };
    let metadata = if result.exists(1) {
        Some(result.content_as::<DocumentMetadata>(1)?)
    } else {
        None
    };

    Ok(DocumentLookup {
        id: id.to_string(),
        cas: result.cas,
        is_tombstone: result.tombstone,
        body: if full_document {
            result.content(3).cloned()
        } else {
            None
        },
        staged_content: result.content(2).cloned(),
        txn,
        metadata,
    })
}

/// Builds the staging specs writing a full `txn` tree for one mutation.
///
/// The `txn` root is wiped first so a restage never inherits stale fields;
/// the value checksum is macro-expanded from the document's current value.
#[must_use]
pub fn staging_specs(
    transaction_id: &TransactionId,
    attempt_id: &AttemptId,
    atr_keyspace: &Keyspace,
    atr_id: &str,
    staged_content: Value,
) -> Vec<MutateInSpec> {
    vec![
        MutateInSpec::upsert(fields::TXN_PREFIX, json!({})).xattr().create_path(),
        MutateInSpec::upsert(fields::TXN_ID, json!(transaction_id.to_string())).xattr(),
        MutateInSpec::upsert(fields::TXN_ATR_ID, json!(atr_id)).xattr(),
        MutateInSpec::upsert(fields::TXN_ATR_BUCKET, json!(atr_keyspace.bucket)).xattr(),
        MutateInSpec::upsert(fields::TXN_ATR_SCOPE, json!(atr_keyspace.scope)).xattr(),
        MutateInSpec::upsert(fields::TXN_ATR_COLLECTION, json!(atr_keyspace.collection)).xattr(),
        MutateInSpec::upsert(fields::TXN_STAGED_VERSION, json!(attempt_id.to_string())).xattr(),
        MutateInSpec::upsert(fields::TXN_STAGED_DATA, staged_content).xattr(),
        MutateInSpec::upsert(fields::TXN_CRC32, MutationMacro::ValueCrc32c).xattr(),
    ]
}

/// Stages an insert: a tombstone-backed write invisible to plain reads.
///
/// With no CAS the document must not exist and is created as a tombstone;
/// with a CAS (restage, or staging over a bare tombstone) the write
/// replaces in place.
///
/// # Errors
///
/// `DocumentExists` when a live document is in the way, `CasMismatch` when
/// the tombstone moved.
pub async fn mutate_staged_insert(
    collection: &dyn KvCollection,
    id: &str,
    specs: &[MutateInSpec],
    cas: Option<Cas>,
    durability: DurabilityLevel,
    kv_timeout: Option<Duration>,
) -> Result<MutateInResult> {
    let options = MutateInOptions::default()
        .with_durability(durability)
        .with_timeout(kv_timeout)
        .with_access_deleted();
    let options = match cas {
        Some(cas) => options
            .with_cas(cas)
            .with_store_semantics(StoreSemantics::Replace),
        None => options
            .with_store_semantics(StoreSemantics::Insert)
            .with_create_as_deleted(),
    };
    Ok(collection.mutate_in(id, specs, options).await?)
}

/// Stages a replace or remove against a live document under its CAS.
///
/// # Errors
///
/// `CasMismatch` when a concurrent writer moved the document.
pub async fn mutate_staged_replace_or_remove(
    collection: &dyn KvCollection,
    id: &str,
    specs: &[MutateInSpec],
    cas: Cas,
    durability: DurabilityLevel,
    kv_timeout: Option<Duration>,
) -> Result<MutateInResult> {
    let options = MutateInOptions::default()
        .with_cas(cas)
        .with_durability(durability)
        .with_timeout(kv_timeout);
    Ok(collection.mutate_in(id, specs, options).await?)
}

/// Applies staged content as the real document body and strips the staging
/// xattrs. `insert_mode` revives a staged-as-deleted document via a full
/// insert; otherwise the body is replaced in place under CAS.
///
/// # Errors
///
/// Propagates collaborator failures (`DocumentExists`, `CasMismatch`, ...).
pub async fn unstage_insert_or_replace(
    collection: &dyn KvCollection,
    id: &str,
    cas: Cas,
    final_doc: Value,
    insert_mode: bool,
    durability: DurabilityLevel,
    kv_timeout: Option<Duration>,
) -> Result<Cas> {
    if insert_mode {
        let result = collection
            .insert(
                id,
                final_doc,
                InsertOptions::default()
                    .with_durability(durability)
                    .with_timeout(kv_timeout),
            )
            .await?;
        Ok(result.cas)
    } else {
        let specs = [
            MutateInSpec::remove(fields::TXN_PREFIX).xattr(),
            MutateInSpec::set_doc(final_doc),
        ];
        let result = collection
            .mutate_in(
                id,
                &specs,
                MutateInOptions::default()
                    .with_cas(cas)
                    .with_durability(durability)
                    .with_timeout(kv_timeout),
            )
            .await?;
        Ok(result.cas)
    }
}

/// Physically deletes a document whose removal was staged.
///
/// # Errors
///
/// Propagates collaborator failures.
pub async fn unstage_remove(
    collection: &dyn KvCollection,
    id: &str,
    cas: Cas,
    durability: DurabilityLevel,
    kv_timeout: Option<Duration>,
) -> Result<()> {
    collection
        .remove(
            id,
            RemoveOptions::default()
                .with_cas(cas)
                .with_durability(durability)
                .with_timeout(kv_timeout),
        )
        .await?;
    Ok(())
}

/// Strips the staging xattrs, releasing the document back to its
/// pre-transaction value. The upsert-then-remove pair makes the strip safe
/// whether or not the `txn` tree still exists.
///
/// # Errors
///
/// Propagates collaborator failures.
pub async fn clear_transaction_metadata(
    collection: &dyn KvCollection,
    id: &str,
    cas: Cas,
    is_tombstone: bool,
    durability: DurabilityLevel,
    kv_timeout: Option<Duration>,
) -> Result<()> {
    let specs = [
        MutateInSpec::upsert(fields::TXN_PREFIX, Value::Null).xattr(),
        MutateInSpec::remove(fields::TXN_PREFIX).xattr(),
    ];
    let mut options = MutateInOptions::default()
        .with_cas(cas)
        .with_durability(durability)
        .with_timeout(kv_timeout);
    if is_tombstone {
        options = options.with_access_deleted();
    }
    collection.mutate_in(id, &specs, options).await?;
    Ok(())
}

/// Rolls back a staged insert by stripping its staging xattrs, leaving a
/// bare tombstone behind.
///
/// # Errors
///
/// Propagates collaborator failures.
pub async fn remove_staged_insert(
    collection: &dyn KvCollection,
    id: &str,
    cas: Cas,
    durability: DurabilityLevel,
    kv_timeout: Option<Duration>,
) -> Result<()> {
    let specs = [MutateInSpec::remove(fields::TXN_PREFIX).xattr()];
    collection
        .mutate_in(
            id,
            &specs,
            MutateInOptions::default()
                .with_cas(cas)
                .with_durability(durability)
                .with_timeout(kv_timeout)
                .with_access_deleted(),
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removal_sentinel_is_recognized() {
        let lookup = DocumentLookup {
            id: "doc".into(),
            cas: 1,
            is_tombstone: false,
            body: None,
            staged_content: Some(json!(fields::REMOVED_SENTINEL)),
            txn: None,
            metadata: None,
        };
        assert!(lookup.staged_as_removal());

        let lookup = DocumentLookup {
            staged_content: Some(json!({"n": 1})),
            ..lookup
        };
        assert!(!lookup.staged_as_removal());
    }

    #[test]
    fn xattr_ownership_matches_on_attempt_id() {
        let attempt = AttemptId::generate();
        let xattrs = TransactionXattrs {
            staging_version: Some(attempt.to_string()),
            ..TransactionXattrs::default()
        };
        assert!(xattrs.owned_by(&attempt));
        assert!(!xattrs.owned_by(&AttemptId::generate()));
    }

    #[test]
    fn atr_keyspace_requires_all_coordinates() {
        let xattrs = TransactionXattrs {
            atr_bucket: Some("main".into()),
            atr_scope: Some("_default".into()),
            ..TransactionXattrs::default()
        };
        assert!(xattrs.atr_keyspace().is_none());

        let xattrs = TransactionXattrs {
            atr_collection: Some("_default".into()),
            ..xattrs
        };
        assert_eq!(
            xattrs.atr_keyspace(),
            Some(Keyspace::default_collection("main"))
        );
    }

    #[test]
    fn staging_specs_cover_the_txn_tree() {
        let specs = staging_specs(
            &TransactionId::generate(),
            &AttemptId::generate(),
            &Keyspace::default_collection("main"),
            "_txn:atr-3",
            json!({"n": 2}),
        );
        let paths: Vec<&str> = specs.iter().map(|s| s.path.as_str()).collect();
        assert_eq!(paths[0], fields::TXN_PREFIX);
        assert!(paths.contains(&fields::TXN_STAGED_VERSION));
        assert!(paths.contains(&fields::TXN_STAGED_DATA));
        assert!(paths.contains(&fields::TXN_CRC32));
        assert!(specs.iter().all(|s| s.xattr));
    }
}
