//! Active Transaction Record access.
//!
//! The ATR is a plain document whose xattrs hold an append-only map of
//! attempt-id → attempt metadata. Contention between unrelated attempts
//! sharing an ATR is resolved by sub-document semantics on each
//! `attempts.<id>` subtree, never whole-document locking.
//!
//! Timestamps (`tst`, `tsc`, `rbs`) are macro-expanded from the mutation's
//! own CAS, so the server's clock stamps the entry without a second round
//! trip.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};

use atoll_core::{AttemptId, AttemptState, DocRecord, DurabilityLevel, Keyspace, TransactionId};
use atoll_kv::{
    KvCollection, KvError, LookupInOptions, LookupInSpec, MutateInOptions, MutateInSpec,
    MutationMacro, StoreSemantics,
};

use crate::error::Result;
use crate::fields;
use crate::forwards::ForwardCompatibility;

/// Document references grouped by staged-mutation type, as recorded in the
/// ATR entry at the commit/abort decision point.
#[derive(Debug, Clone, Default)]
pub struct DocRecordLists {
    /// Documents staged as inserts.
    pub inserted: Vec<DocRecord>,
    /// Documents staged as replaces.
    pub replaced: Vec<DocRecord>,
    /// Documents staged as removes.
    pub removed: Vec<DocRecord>,
}

fn record_value(record: &DocRecord) -> Value {
    json!({
        "bkt": record.keyspace.bucket,
        "scp": record.keyspace.scope,
        "col": record.keyspace.collection,
        "id": record.id,
    })
}

fn records_value(records: &[DocRecord]) -> Value {
    Value::Array(records.iter().map(record_value).collect())
}

/// Repository for one attempt's entry in its ATR document.
pub struct AtrRecord {
    collection: Arc<dyn KvCollection>,
    atr_id: String,
    attempt_id: AttemptId,
    root: String,
    durability: DurabilityLevel,
    kv_timeout: Option<Duration>,
}

impl AtrRecord {
    /// Creates a repository for `attempt_id`'s entry in `atr_id`.
    #[must_use]
    pub fn new(
        collection: Arc<dyn KvCollection>,
        atr_id: impl Into<String>,
        attempt_id: AttemptId,
        durability: DurabilityLevel,
        kv_timeout: Option<Duration>,
    ) -> Self {
        let atr_id = atr_id.into();
        let root = fields::atr_entry_root(&attempt_id.to_string());
        Self {
            collection,
            atr_id,
            attempt_id,
            root,
            durability,
            kv_timeout,
        }
    }

    /// The ATR document id.
    #[must_use]
    pub fn atr_id(&self) -> &str {
        &self.atr_id
    }

    /// The keyspace the ATR document lives in.
    #[must_use]
    pub fn keyspace(&self) -> &Keyspace {
        self.collection.keyspace()
    }

    /// The collection handle the ATR document lives in.
    #[must_use]
    pub fn collection(&self) -> &Arc<dyn KvCollection> {
        &self.collection
    }

    fn path(&self, field: &str) -> String {
        format!("{}.{field}", self.root)
    }

    fn mutate_options(&self, semantics: StoreSemantics) -> MutateInOptions {
        MutateInOptions::default()
            .with_durability(self.durability)
            .with_store_semantics(semantics)
            .with_timeout(self.kv_timeout)
    }

    /// Creates the attempt's entry in state `PENDING`, creating the ATR
    /// document itself if this is its first use.
    ///
    /// The fields are `Insert`s, not upserts: a pre-existing entry for this
    /// attempt id is a protocol violation and surfaces as `PathExists`.
    ///
    /// # Errors
    ///
    /// Propagates collaborator failures.
    pub async fn mutate_atr_pending(
        &self,
        transaction_id: &TransactionId,
        expiration: Duration,
    ) -> Result<()> {
        let specs = [
            MutateInSpec::insert(
                self.path(fields::ATR_FIELD_TRANSACTION_ID),
                json!(transaction_id.to_string()),
            )
            .xattr()
            .create_path(),
            MutateInSpec::insert(
                self.path(fields::ATR_FIELD_STATUS),
                json!(AttemptState::Pending.as_wire_str()),
            )
            .xattr(),
            MutateInSpec::insert(
                self.path(fields::ATR_FIELD_START_TIMESTAMP),
                MutationMacro::Cas,
            )
            .xattr(),
            MutateInSpec::insert(
                self.path(fields::ATR_FIELD_EXPIRES_AFTER_MSECS),
                json!(expiration.as_millis() as u64),
            )
            .xattr(),
            MutateInSpec::insert(
                self.path(fields::ATR_FIELD_DURABILITY),
                json!(self.durability.as_short_str()),
            )
            .xattr(),
        ];

        let result = self
            .collection
            .mutate_in(&self.atr_id, &specs, self.mutate_options(StoreSemantics::Upsert))
            .await?;
        tracing::info!(
            atr_id = %self.atr_id,
            attempt_id = %self.attempt_id,
            cas = result.cas,
            "created ATR entry as PENDING"
        );
        Ok(())
    }

    /// Moves the entry to `COMMITTED`, recording the commit timestamp and
    /// the per-type affected-document lists.
    ///
    /// The pending sentinel is `Insert`ed alongside: if a cleanup of this
    /// entry raced us and already planted it, the commit loses with
    /// `PathExists` instead of resurrecting a half-removed entry.
    ///
    /// # Errors
    ///
    /// Propagates collaborator failures.
    pub async fn mutate_atr_commit(&self, docs: &DocRecordLists) -> Result<()> {
        let specs = [
            MutateInSpec::upsert(
                self.path(fields::ATR_FIELD_STATUS),
                json!(AttemptState::Committed.as_wire_str()),
            )
            .xattr(),
            MutateInSpec::upsert(
                self.path(fields::ATR_FIELD_COMMIT_TIMESTAMP),
                MutationMacro::Cas,
            )
            .xattr(),
            MutateInSpec::upsert(
                self.path(fields::ATR_FIELD_DOCS_INSERTED),
                records_value(&docs.inserted),
            )
            .xattr(),
            MutateInSpec::upsert(
                self.path(fields::ATR_FIELD_DOCS_REPLACED),
                records_value(&docs.replaced),
            )
            .xattr(),
            MutateInSpec::upsert(
                self.path(fields::ATR_FIELD_DOCS_REMOVED),
                records_value(&docs.removed),
            )
            .xattr(),
            MutateInSpec::insert(self.path(fields::ATR_FIELD_PENDING_SENTINEL), json!(0)).xattr(),
        ];

        let result = self
            .collection
            .mutate_in(&self.atr_id, &specs, self.mutate_options(StoreSemantics::Replace))
            .await?;
        tracing::debug!(
            atr_id = %self.atr_id,
            attempt_id = %self.attempt_id,
            cas = result.cas,
            "updated ATR entry to COMMITTED"
        );
        Ok(())
    }

    /// Moves the entry to `ABORTED`, recording the rollback-start timestamp
    /// and the per-type affected-document lists.
    ///
    /// # Errors
    ///
    /// Propagates collaborator failures.
    pub async fn mutate_atr_aborted(&self, docs: &DocRecordLists) -> Result<()> {
        let specs = [
            MutateInSpec::upsert(
                self.path(fields::ATR_FIELD_STATUS),
                json!(AttemptState::Aborted.as_wire_str()),
            )
            .xattr(),
            MutateInSpec::upsert(
                self.path(fields::ATR_FIELD_ROLLBACK_START_TIMESTAMP),
                MutationMacro::Cas,
            )
            .xattr(),
            MutateInSpec::upsert(
                self.path(fields::ATR_FIELD_DOCS_INSERTED),
                records_value(&docs.inserted),
            )
            .xattr(),
            MutateInSpec::upsert(
                self.path(fields::ATR_FIELD_DOCS_REPLACED),
                records_value(&docs.replaced),
            )
            .xattr(),
            MutateInSpec::upsert(
                self.path(fields::ATR_FIELD_DOCS_REMOVED),
                records_value(&docs.removed),
            )
            .xattr(),
        ];

        let result = self
            .collection
            .mutate_in(&self.atr_id, &specs, self.mutate_options(StoreSemantics::Replace))
            .await?;
        tracing::debug!(
            atr_id = %self.atr_id,
            attempt_id = %self.attempt_id,
            cas = result.cas,
            "updated ATR entry to ABORTED"
        );
        Ok(())
    }

    /// Removes the entry after all documents were unstaged.
    ///
    /// # Errors
    ///
    /// Propagates collaborator failures, including `PathNotFound` when the
    /// entry was already removed; the caller decides whether that is
    /// tolerable.
    pub async fn mutate_atr_complete(&self) -> Result<()> {
        self.remove_entry("removed completed ATR entry").await
    }

    /// Removes the entry after all staged changes were reverted.
    ///
    /// # Errors
    ///
    /// Propagates collaborator failures.
    pub async fn mutate_atr_rolled_back(&self) -> Result<()> {
        self.remove_entry("removed rolled-back ATR entry").await
    }

    async fn remove_entry(&self, message: &'static str) -> Result<()> {
        let specs = [MutateInSpec::remove(&self.root).xattr()];
        let result = self
            .collection
            .mutate_in(&self.atr_id, &specs, self.mutate_options(StoreSemantics::Replace))
            .await?;
        tracing::debug!(
            atr_id = %self.atr_id,
            attempt_id = %self.attempt_id,
            cas = result.cas,
            message
        );
        Ok(())
    }

    /// Re-reads the entry's current state from the ATR, if it still exists.
    ///
    /// # Errors
    ///
    /// Propagates collaborator failures.
    pub async fn lookup_atr_state(&self) -> Result<Option<AttemptState>> {
        let specs = [LookupInSpec::get(self.path(fields::ATR_FIELD_STATUS), true)];
        let result = self
            .collection
            .lookup_in(
                &self.atr_id,
                &specs,
                LookupInOptions::default()
                    .with_access_deleted()
                    .with_timeout(self.kv_timeout),
            )
            .await;
        match result {
            Ok(looked) => Ok(looked
                .content(0)
                .and_then(Value::as_str)
                .map(AttemptState::parse_wire)),
            Err(KvError::DocumentNotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Finds one attempt's parsed entry in an ATR document.
    ///
    /// Returns `None` when the ATR document or the entry does not exist.
    ///
    /// # Errors
    ///
    /// Propagates collaborator failures.
    pub async fn find_entry(
        collection: &dyn KvCollection,
        atr_id: &str,
        attempt_id: &str,
        kv_timeout: Option<Duration>,
    ) -> Result<Option<AtrEntry>> {
        let specs = [LookupInSpec::get(fields::ATR_FIELD_ATTEMPTS, true)];
        let result = collection
            .lookup_in(
                atr_id,
                &specs,
                LookupInOptions::default()
                    .with_access_deleted()
                    .with_timeout(kv_timeout),
            )
            .await;
        let looked = match result {
            Ok(looked) => looked,
            Err(KvError::DocumentNotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let Some(attempts) = looked.content(0).and_then(Value::as_object) else {
            return Ok(None);
        };
        match attempts.get(attempt_id) {
            Some(entry) => Ok(Some(AtrEntry::from_value(attempt_id, entry)?)),
            None => Ok(None),
        }
    }
}

/// One attempt's metadata parsed out of an ATR's attempts map.
#[derive(Debug, Clone)]
pub struct AtrEntry {
    /// The attempt id the entry is keyed by.
    pub attempt_id: String,
    /// Last recorded state. Unrecognized wire strings parse to `Unknown`.
    pub state: AttemptState,
    /// The owning transaction id.
    pub transaction_id: Option<String>,
    /// Start timestamp (raw CAS hex as written by macro expansion).
    pub start_timestamp: Option<String>,
    /// Commit timestamp (raw CAS hex).
    pub commit_timestamp: Option<String>,
    /// Rollback-start timestamp (raw CAS hex).
    pub rollback_start_timestamp: Option<String>,
    /// Expiry in milliseconds from the start timestamp.
    pub expires_after_ms: Option<u64>,
    /// Durability the attempt ran with.
    pub durability: Option<DurabilityLevel>,
    /// Documents staged as inserts.
    pub inserted: Vec<DocRecord>,
    /// Documents staged as replaces.
    pub replaced: Vec<DocRecord>,
    /// Documents staged as removes.
    pub removed: Vec<DocRecord>,
    /// Forward-compatibility requirements recorded by the writing client.
    pub forward_compatibility: Option<ForwardCompatibility>,
}

#[derive(Debug, Deserialize)]
struct RawDocRecord {
    bkt: String,
    scp: String,
    col: String,
    id: String,
}

impl From<RawDocRecord> for DocRecord {
    fn from(raw: RawDocRecord) -> Self {
        DocRecord::new(Keyspace::new(raw.bkt, raw.scp, raw.col), raw.id)
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawAtrEntry {
    st: Option<String>,
    tid: Option<String>,
    tst: Option<String>,
    tsc: Option<String>,
    rbs: Option<String>,
    exp: Option<u64>,
    d: Option<String>,
    ins: Option<Vec<RawDocRecord>>,
    rep: Option<Vec<RawDocRecord>>,
    rem: Option<Vec<RawDocRecord>>,
    fc: Option<ForwardCompatibility>,
}

impl AtrEntry {
    /// Parses an entry value from the attempts map.
    ///
    /// # Errors
    ///
    /// `KvError::Internal` (wrapped) when the entry is not an object at
    /// all; individual unparseable fields degrade to `None`/`Unknown`.
    pub fn from_value(attempt_id: &str, value: &Value) -> Result<Self> {
        let raw: RawAtrEntry = serde_json::from_value(value.clone()).map_err(|e| {
            KvError::internal(format!("unparseable ATR entry for {attempt_id}: {e}"))
        })?;

        Ok(Self {
            attempt_id: attempt_id.to_string(),
            state: raw
                .st
                .as_deref()
                .map_or(AttemptState::Unknown, AttemptState::parse_wire),
            transaction_id: raw.tid,
            start_timestamp: raw.tst,
            commit_timestamp: raw.tsc,
            rollback_start_timestamp: raw.rbs,
            expires_after_ms: raw.exp,
            durability: raw.d.as_deref().map(DurabilityLevel::from_short_str),
            inserted: raw.ins.unwrap_or_default().into_iter().map(Into::into).collect(),
            replaced: raw.rep.unwrap_or_default().into_iter().map(Into::into).collect(),
            removed: raw.rem.unwrap_or_default().into_iter().map(Into::into).collect(),
            forward_compatibility: raw.fc,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use atoll_kv::{KvCluster, MemoryCluster};

    async fn atr_record(cluster: &MemoryCluster, attempt_id: AttemptId) -> AtrRecord {
        let keyspace = Keyspace::default_collection("main");
        let collection = cluster.collection(&keyspace).await.unwrap();
        AtrRecord::new(
            collection,
            "_txn:atr-9",
            attempt_id,
            DurabilityLevel::Majority,
            None,
        )
    }

    #[tokio::test]
    async fn entry_lifecycle_pending_commit_remove() {
        let cluster = MemoryCluster::new();
        let attempt_id = AttemptId::generate();
        let transaction_id = TransactionId::generate();
        let atr = atr_record(&cluster, attempt_id).await;

        atr.mutate_atr_pending(&transaction_id, Duration::from_secs(15))
            .await
            .unwrap();
        assert_eq!(
            atr.lookup_atr_state().await.unwrap(),
            Some(AttemptState::Pending)
        );

        let entry = AtrRecord::find_entry(
            atr.collection().as_ref(),
            "_txn:atr-9",
            &attempt_id.to_string(),
            None,
        )
        .await
        .unwrap()
        .expect("pending entry");
        assert_eq!(entry.state, AttemptState::Pending);
        assert_eq!(entry.transaction_id, Some(transaction_id.to_string()));
        assert_eq!(entry.expires_after_ms, Some(15_000));
        assert_eq!(entry.durability, Some(DurabilityLevel::Majority));
        assert!(entry.start_timestamp.is_some());

        let docs = DocRecordLists {
            inserted: vec![DocRecord::new(Keyspace::default_collection("main"), "a")],
            replaced: vec![],
            removed: vec![DocRecord::new(Keyspace::default_collection("main"), "b")],
        };
        atr.mutate_atr_commit(&docs).await.unwrap();

        let entry = AtrRecord::find_entry(
            atr.collection().as_ref(),
            "_txn:atr-9",
            &attempt_id.to_string(),
            None,
        )
        .await
        .unwrap()
        .expect("committed entry");
        assert_eq!(entry.state, AttemptState::Committed);
        assert!(entry.commit_timestamp.is_some());
        assert_eq!(entry.inserted.len(), 1);
        assert_eq!(entry.removed[0].id, "b");

        atr.mutate_atr_complete().await.unwrap();
        assert_eq!(atr.lookup_atr_state().await.unwrap(), None);
        assert!(
            AtrRecord::find_entry(
                atr.collection().as_ref(),
                "_txn:atr-9",
                &attempt_id.to_string(),
                None,
            )
            .await
            .unwrap()
            .is_none()
        );
    }

    #[tokio::test]
    async fn entry_lifecycle_abort_rolls_back() {
        let cluster = MemoryCluster::new();
        let attempt_id = AttemptId::generate();
        let atr = atr_record(&cluster, attempt_id).await;

        atr.mutate_atr_pending(&TransactionId::generate(), Duration::from_secs(15))
            .await
            .unwrap();
        atr.mutate_atr_aborted(&DocRecordLists::default()).await.unwrap();
        assert_eq!(
            atr.lookup_atr_state().await.unwrap(),
            Some(AttemptState::Aborted)
        );

        atr.mutate_atr_rolled_back().await.unwrap();
        assert_eq!(atr.lookup_atr_state().await.unwrap(), None);
    }

    #[tokio::test]
    async fn duplicate_pending_entry_is_a_path_conflict() {
        let cluster = MemoryCluster::new();
        let attempt_id = AttemptId::generate();
        let atr = atr_record(&cluster, attempt_id).await;
        let transaction_id = TransactionId::generate();

        atr.mutate_atr_pending(&transaction_id, Duration::from_secs(15))
            .await
            .unwrap();
        let err = atr
            .mutate_atr_pending(&transaction_id, Duration::from_secs(15))
            .await
            .unwrap_err();
        assert_eq!(err.classify(), crate::error::ErrorClass::FailPathAlreadyExists);
    }

    #[tokio::test]
    async fn find_entry_on_missing_atr_document_is_none() {
        let cluster = MemoryCluster::new();
        let keyspace = Keyspace::default_collection("main");
        let collection = cluster.collection(&keyspace).await.unwrap();
        assert!(
            AtrRecord::find_entry(collection.as_ref(), "_txn:atr-0", "a-1", None)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn entry_parses_doc_lists_and_state() {
        let value = json!({
            "st": "COMMITTED",
            "tid": "t-1",
            "tst": "0x0000000000000001",
            "tsc": "0x0000000000000002",
            "exp": 15000,
            "d": "m",
            "ins": [{"bkt": "main", "scp": "_default", "col": "_default", "id": "a"}],
            "rep": [],
            "rem": [{"bkt": "main", "scp": "s", "col": "c", "id": "b"}],
            "p": 0,
        });
        let entry = AtrEntry::from_value("a-1", &value).unwrap();
        assert_eq!(entry.state, AttemptState::Committed);
        assert_eq!(entry.durability, Some(DurabilityLevel::Majority));
        assert_eq!(entry.inserted.len(), 1);
        assert_eq!(entry.inserted[0].id, "a");
        assert_eq!(entry.removed[0].keyspace, Keyspace::new("main", "s", "c"));
        assert!(entry.replaced.is_empty());
    }

    #[test]
    fn entry_with_future_state_parses_to_unknown() {
        let value = json!({"st": "EXT_SOMETHING_NEW"});
        let entry = AtrEntry::from_value("a-1", &value).unwrap();
        assert_eq!(entry.state, AttemptState::Unknown);
    }

    #[test]
    fn entry_missing_state_parses_to_unknown() {
        let entry = AtrEntry::from_value("a-1", &json!({})).unwrap();
        assert_eq!(entry.state, AttemptState::Unknown);
    }
}
