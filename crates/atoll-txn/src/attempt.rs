//! Per-attempt orchestration of the staged-mutation protocol.
//!
//! An [`AttemptContext`] is one try at a transaction's mutations. It stages
//! inserts/replaces/removals into document xattrs under CAS, lazily creates
//! the attempt's ATR entry on the first mutation, and drives commit or
//! rollback. Within one attempt, staging is sequential; only the
//! commit-time unstage fan-out runs concurrently, and deliberately
//! unordered; the ATR, not document state, is the authority an observer
//! must consult.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::Instrument as _;

use atoll_core::observability::attempt_span;
use atoll_core::{AttemptId, AttemptState, DocRecord, TransactionId};
use atoll_kv::{Cas, KvCluster, KvCollection, KvError};

use crate::atr::{AtrRecord, DocRecordLists};
use crate::cleanup::cleaner::Cleaner;
use crate::cleanup::request::CleanupRequest;
use crate::config::TransactionConfig;
use crate::document::{self, TransactionXattrs};
use crate::error::{ErrorClass, Result, TransactionError};
use crate::fields;

/// The kind of mutation an attempt staged against a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagedMutationType {
    /// The document is created by this attempt (staged into a tombstone).
    Insert,
    /// The document's body is replaced by this attempt.
    Replace,
    /// The document is deleted by this attempt.
    Remove,
}

/// One staged write tracked by the attempt, with the CAS the staging
/// mutation produced.
#[derive(Debug, Clone)]
pub struct StagedMutation {
    /// The document the mutation targets.
    pub record: DocRecord,
    /// The kind of staged mutation.
    pub mutation_type: StagedMutationType,
    /// CAS of the document after staging.
    pub cas: Cas,
    /// Staged content (`None` for removals).
    pub content: Option<Value>,
}

/// A document as read within an attempt: content plus the CAS to mutate
/// under, and any staging metadata observed with it.
#[derive(Debug, Clone)]
pub struct TransactionGetResult {
    /// The document's coordinates.
    pub record: DocRecord,
    /// CAS at read (or staging) time.
    pub cas: Cas,
    /// The visible (or read-your-writes staged) content.
    pub content: Value,
    pub(crate) txn: Option<TransactionXattrs>,
}

/// Per-attempt orchestrator for the staged-mutation protocol.
pub struct AttemptContext {
    cluster: Arc<dyn KvCluster>,
    config: TransactionConfig,
    transaction_id: TransactionId,
    attempt_id: AttemptId,
    state: AttemptState,
    atr: Option<AtrRecord>,
    staged: Vec<StagedMutation>,
    expires_at: DateTime<Utc>,
    unstaging_complete: bool,
}

impl AttemptContext {
    /// Creates a fresh attempt for `transaction_id`.
    #[must_use]
    pub fn new(
        cluster: Arc<dyn KvCluster>,
        config: TransactionConfig,
        transaction_id: TransactionId,
    ) -> Self {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(config.expiration)
                .unwrap_or_else(|_| chrono::Duration::seconds(15));
        Self {
            cluster,
            config,
            transaction_id,
            attempt_id: AttemptId::generate(),
            state: AttemptState::NothingWritten,
            atr: None,
            staged: Vec::new(),
            expires_at,
            unstaging_complete: true,
        }
    }

    /// This attempt's id.
    #[must_use]
    pub fn attempt_id(&self) -> &AttemptId {
        &self.attempt_id
    }

    /// The owning transaction's id.
    #[must_use]
    pub fn transaction_id(&self) -> &TransactionId {
        &self.transaction_id
    }

    /// Current attempt state.
    #[must_use]
    pub fn state(&self) -> AttemptState {
        self.state
    }

    /// When the attempt becomes eligible for lost cleanup.
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Whether every staged mutation was unstaged after commit. `false`
    /// means the cleanup subsystem owns finishing the job.
    #[must_use]
    pub fn unstaging_complete(&self) -> bool {
        self.unstaging_complete
    }

    /// The attempt's staged writes, in staging order.
    #[must_use]
    pub fn staged_mutations(&self) -> &[StagedMutation] {
        &self.staged
    }

    /// Reads a document within the attempt.
    ///
    /// Read-your-writes: a document staged by this attempt returns its
    /// staged version; one staged for removal reads as absent. Everything
    /// else is one atomic body-plus-xattrs lookup, so concurrent staging
    /// is observed consistently with the body.
    ///
    /// # Errors
    ///
    /// `Expired` past the attempt expiry; collaborator failures.
    pub async fn get(&self, record: &DocRecord) -> Result<Option<TransactionGetResult>> {
        self.check_expiry("get")?;

        if let Some(index) = self.staged_index(record) {
            let staged = &self.staged[index];
            return Ok(match staged.mutation_type {
                StagedMutationType::Remove => None,
                _ => Some(TransactionGetResult {
                    record: record.clone(),
                    cas: staged.cas,
                    content: staged.content.clone().unwrap_or(Value::Null),
                    txn: None,
                }),
            });
        }

        let collection = self.collection_for(record).await?;
        let lookup = match document::lookup_document(
            collection.as_ref(),
            &record.id,
            self.config.kv_timeout,
            true,
        )
        .await
        {
            Ok(lookup) => lookup,
            Err(TransactionError::Kv(KvError::DocumentNotFound { .. })) => return Ok(None),
            Err(e) => return Err(e),
        };

        match lookup.body {
            Some(content) => Ok(Some(TransactionGetResult {
                record: record.clone(),
                cas: lookup.cas,
                content,
                txn: lookup.txn,
            })),
            None => Ok(None),
        }
    }

    /// Stages an insert: the content lands in a tombstone's xattrs,
    /// invisible to plain reads until commit.
    ///
    /// # Errors
    ///
    /// `Conflict` when another attempt has the document staged;
    /// `DocumentExists` when a live document is in the way; `Expired` past
    /// the attempt expiry.
    pub async fn insert(&mut self, record: &DocRecord, content: Value) -> Result<TransactionGetResult> {
        self.check_expiry("insert")?;
        self.check_not_done("insert")?;

        if let Some(index) = self.staged_index(record) {
            return match self.staged[index].mutation_type {
                // Insert after our own staged remove nets out to a replace.
                StagedMutationType::Remove => {
                    let cas = self.staged[index].cas;
                    self.restage(record, index, StagedMutationType::Replace, content, cas).await
                }
                _ => Err(KvError::doc_exists(&record.id).into()),
            };
        }

        self.set_atr_pending_if_first(record).await?;
        let collection = self.collection_for(record).await?;
        let specs = self.staging_specs_for(content.clone())?;

        let staging = document::mutate_staged_insert(
            collection.as_ref(),
            &record.id,
            &specs,
            None,
            self.config.durability,
            self.config.kv_timeout,
        )
        .await;

        let result = match staging {
            Ok(result) => result,
            Err(TransactionError::Kv(KvError::DocumentExists { .. })) => {
                let lookup = document::lookup_document(
                    collection.as_ref(),
                    &record.id,
                    self.config.kv_timeout,
                    false,
                )
                .await?;
                match &lookup.txn {
                    Some(txn) if !txn.owned_by(&self.attempt_id) => {
                        return Err(TransactionError::conflict(format!(
                            "document {record} is staged by another attempt"
                        )));
                    }
                    _ if lookup.is_tombstone => {
                        // A bare (or our own) tombstone: stage in place
                        // under its CAS.
                        document::mutate_staged_insert(
                            collection.as_ref(),
                            &record.id,
                            &specs,
                            Some(lookup.cas),
                            self.config.durability,
                            self.config.kv_timeout,
                        )
                        .await
                        .map_err(Self::conflict_on_cas_mismatch)?
                    }
                    _ => return Err(KvError::doc_exists(&record.id).into()),
                }
            }
            Err(e) => return Err(Self::conflict_on_cas_mismatch(e)),
        };

        self.track(record, StagedMutationType::Insert, result.cas, Some(content.clone()));
        Ok(TransactionGetResult {
            record: record.clone(),
            cas: result.cas,
            content,
            txn: None,
        })
    }

    /// Stages a replace of a document previously read in this attempt.
    ///
    /// # Errors
    ///
    /// `Conflict` when the document moved since the read or carries another
    /// attempt's staging; `Expired` past the attempt expiry.
    pub async fn replace(
        &mut self,
        doc: &TransactionGetResult,
        content: Value,
    ) -> Result<TransactionGetResult> {
        self.check_expiry("replace")?;
        self.check_not_done("replace")?;
        self.check_write_write_conflict(doc)?;

        if let Some(index) = self.staged_index(&doc.record) {
            let record = doc.record.clone();
            return match self.staged[index].mutation_type {
                StagedMutationType::Remove => Err(TransactionError::illegal_state(format!(
                    "document {record} is already staged for removal"
                ))),
                // Replace after our own staged insert stays an insert.
                mutation_type => {
                    let cas = self.staged[index].cas;
                    self.restage(&record, index, mutation_type, content, cas).await
                }
            };
        }

        self.set_atr_pending_if_first(&doc.record).await?;
        let collection = self.collection_for(&doc.record).await?;
        let specs = self.staging_specs_for(content.clone())?;
        let result = document::mutate_staged_replace_or_remove(
            collection.as_ref(),
            &doc.record.id,
            &specs,
            doc.cas,
            self.config.durability,
            self.config.kv_timeout,
        )
        .await
        .map_err(Self::conflict_on_cas_mismatch)?;

        self.track(&doc.record, StagedMutationType::Replace, result.cas, Some(content.clone()));
        Ok(TransactionGetResult {
            record: doc.record.clone(),
            cas: result.cas,
            content,
            txn: None,
        })
    }

    /// Stages a removal of a document previously read in this attempt.
    ///
    /// # Errors
    ///
    /// `Conflict` when the document moved since the read or carries another
    /// attempt's staging; `Expired` past the attempt expiry.
    pub async fn remove(&mut self, doc: &TransactionGetResult) -> Result<()> {
        self.check_expiry("remove")?;
        self.check_not_done("remove")?;
        self.check_write_write_conflict(doc)?;

        if let Some(index) = self.staged_index(&doc.record) {
            match self.staged[index].mutation_type {
                // Removing our own staged insert just un-stages it.
                StagedMutationType::Insert => {
                    let cas = self.staged[index].cas;
                    let collection = self.collection_for(&doc.record).await?;
                    document::remove_staged_insert(
                        collection.as_ref(),
                        &doc.record.id,
                        cas,
                        self.config.durability,
                        self.config.kv_timeout,
                    )
                    .await?;
                    self.staged.remove(index);
                    return Ok(());
                }
                StagedMutationType::Remove => {
                    return Err(TransactionError::illegal_state(format!(
                        "document {} is already staged for removal",
                        doc.record
                    )));
                }
                StagedMutationType::Replace => {}
            }
        }

        self.set_atr_pending_if_first(&doc.record).await?;
        let cas = self
            .staged_index(&doc.record)
            .map_or(doc.cas, |index| self.staged[index].cas);
        let collection = self.collection_for(&doc.record).await?;
        let specs = self.staging_specs_for(json!(fields::REMOVED_SENTINEL))?;
        let result = document::mutate_staged_replace_or_remove(
            collection.as_ref(),
            &doc.record.id,
            &specs,
            cas,
            self.config.durability,
            self.config.kv_timeout,
        )
        .await
        .map_err(Self::conflict_on_cas_mismatch)?;

        self.track(&doc.record, StagedMutationType::Remove, result.cas, None);
        Ok(())
    }

    /// Commits the attempt.
    ///
    /// An attempt that staged nothing completes immediately. Otherwise the
    /// ATR entry moves to `COMMITTED` (the commit point), every staged
    /// mutation is unstaged as a concurrently-awaited, unordered fan-out,
    /// and the ATR entry is removed. Unstage failures do not fail the
    /// commit: past the commit point the cleanup subsystem owns finishing
    /// the job, and this method reports it via
    /// [`unstaging_complete`](Self::unstaging_complete).
    ///
    /// # Errors
    ///
    /// Failures *before* the commit point (expiry, ATR mutation).
    pub async fn commit(&mut self) -> Result<()> {
        self.check_not_done("commit")?;
        self.check_expiry("commit")?;

        let Some(atr) = &self.atr else {
            // Nothing was ever staged.
            self.state = AttemptState::Completed;
            return Ok(());
        };

        atr.mutate_atr_commit(&self.doc_record_lists()).await?;
        self.state = AttemptState::Committed;

        let cluster = Arc::clone(&self.cluster);
        let durability = self.config.durability;
        let kv_timeout = self.config.kv_timeout;
        let unstage = self.staged.iter().map(|staged| {
            let cluster = Arc::clone(&cluster);
            async move {
                let run = async {
                    let collection = cluster.collection(&staged.record.keyspace).await?;
                    match staged.mutation_type {
                        StagedMutationType::Insert | StagedMutationType::Replace => {
                            let content = staged.content.clone().ok_or_else(|| {
                                TransactionError::illegal_state(format!(
                                    "staged {} has no content",
                                    staged.record
                                ))
                            })?;
                            document::unstage_insert_or_replace(
                                collection.as_ref(),
                                &staged.record.id,
                                staged.cas,
                                content,
                                staged.mutation_type == StagedMutationType::Insert,
                                durability,
                                kv_timeout,
                            )
                            .await
                            .map(|_| ())
                        }
                        StagedMutationType::Remove => {
                            document::unstage_remove(
                                collection.as_ref(),
                                &staged.record.id,
                                staged.cas,
                                durability,
                                kv_timeout,
                            )
                            .await
                        }
                    }
                };
                run.await.map_err(|error| (staged.record.clone(), error))
            }
        });

        let span = attempt_span(
            "unstage",
            &self.transaction_id.to_string(),
            &self.attempt_id.to_string(),
        );
        let mut failed = 0usize;
        for result in futures::future::join_all(unstage).instrument(span).await {
            if let Err((record, error)) = result {
                failed += 1;
                tracing::warn!(
                    doc = %record,
                    error = %error,
                    "unstage failed after commit point; cleanup will finish the job"
                );
            }
        }
        if failed > 0 {
            self.unstaging_complete = false;
            return Ok(());
        }

        match atr.mutate_atr_complete().await {
            Ok(()) => {}
            Err(e) if e.classify() == ErrorClass::FailPathNotFound => {
                tracing::debug!(atr_id = atr.atr_id(), "ATR entry already removed");
            }
            Err(e) => {
                tracing::warn!(
                    atr_id = atr.atr_id(),
                    error = %e,
                    "failed to remove completed ATR entry; cleanup will remove it"
                );
                return Ok(());
            }
        }
        self.state = AttemptState::Completed;
        Ok(())
    }

    /// Rolls the attempt back.
    ///
    /// The ATR entry moves to `ABORTED`, then the staged documents and the
    /// entry itself are released through the Cleaner's ABORTED path: one
    /// implementation of the revert semantics, shared with background
    /// cleanup.
    ///
    /// # Errors
    ///
    /// `IllegalState` after the commit point; failures from the ATR
    /// mutation or the cleanup pass (the session's queue will retry via a
    /// [`CleanupRequest`] either way).
    pub async fn rollback(&mut self) -> Result<()> {
        match self.state {
            AttemptState::NothingWritten => {
                self.state = AttemptState::RolledBack;
                return Ok(());
            }
            AttemptState::Pending | AttemptState::Aborted => {}
            state => {
                return Err(TransactionError::illegal_state(format!(
                    "cannot roll back an attempt in state {state}"
                )));
            }
        }

        let Some(atr) = &self.atr else {
            self.state = AttemptState::RolledBack;
            return Ok(());
        };

        if self.state == AttemptState::Pending {
            atr.mutate_atr_aborted(&self.doc_record_lists()).await?;
            self.state = AttemptState::Aborted;
        }

        let lists = self.doc_record_lists();
        let request = CleanupRequest::new(
            atr.keyspace().clone(),
            atr.atr_id(),
            self.attempt_id,
            AttemptState::Aborted,
            lists.inserted,
            lists.replaced,
            lists.removed,
            Utc::now(),
            None,
            self.config.durability,
        )?;
        let cleaner = Cleaner::new(Arc::clone(&self.cluster), self.config.kv_timeout);
        let outcome = cleaner.process_cleanup_request(&request, false).await;
        match outcome.failure_reason {
            None => {
                self.staged.clear();
                self.state = AttemptState::RolledBack;
                Ok(())
            }
            Some(reason) => Err(reason),
        }
    }

    /// Converts the attempt into the cleanup work item the owning session
    /// enqueues. `None` when nothing is left to clean (nothing written, or
    /// a fully terminal attempt).
    #[must_use]
    pub fn cleanup_request(&self) -> Option<CleanupRequest> {
        if matches!(
            self.state,
            AttemptState::NothingWritten | AttemptState::Completed | AttemptState::RolledBack
        ) {
            return None;
        }
        let atr = self.atr.as_ref()?;
        let lists = self.doc_record_lists();
        CleanupRequest::new(
            atr.keyspace().clone(),
            atr.atr_id(),
            self.attempt_id,
            self.state,
            lists.inserted,
            lists.replaced,
            lists.removed,
            self.expires_at,
            None,
            self.config.durability,
        )
        .ok()
    }

    /// Lazily creates the ATR entry on the attempt's first mutation,
    /// transitioning `NothingWritten → Pending`. The ATR shard is derived
    /// from the first mutated document's key and lives in that document's
    /// keyspace.
    async fn set_atr_pending_if_first(&mut self, record: &DocRecord) -> Result<()> {
        if self.atr.is_some() {
            return Ok(());
        }
        let atr_id = fields::atr_id_for_key(&record.id);
        let collection = self.cluster.collection(&record.keyspace).await?;
        let atr = AtrRecord::new(
            collection,
            atr_id,
            self.attempt_id,
            self.config.durability,
            self.config.kv_timeout,
        );
        atr.mutate_atr_pending(&self.transaction_id, self.config.expiration)
            .await?;
        self.state = AttemptState::Pending;
        self.atr = Some(atr);
        Ok(())
    }

    /// Re-stages an already-staged document with new content under its
    /// staged CAS, keeping the staged-set entry current.
    async fn restage(
        &mut self,
        record: &DocRecord,
        index: usize,
        mutation_type: StagedMutationType,
        content: Value,
        cas: Cas,
    ) -> Result<TransactionGetResult> {
        let collection = self.collection_for(record).await?;
        let specs = self.staging_specs_for(content.clone())?;
        let result = if mutation_type == StagedMutationType::Insert {
            // Our staged insert lives in a tombstone.
            document::mutate_staged_insert(
                collection.as_ref(),
                &record.id,
                &specs,
                Some(cas),
                self.config.durability,
                self.config.kv_timeout,
            )
            .await
        } else {
            document::mutate_staged_replace_or_remove(
                collection.as_ref(),
                &record.id,
                &specs,
                cas,
                self.config.durability,
                self.config.kv_timeout,
            )
            .await
        }
        .map_err(Self::conflict_on_cas_mismatch)?;

        self.staged[index] = StagedMutation {
            record: record.clone(),
            mutation_type,
            cas: result.cas,
            content: Some(content.clone()),
        };
        Ok(TransactionGetResult {
            record: record.clone(),
            cas: result.cas,
            content,
            txn: None,
        })
    }

    fn staging_specs_for(&self, staged: Value) -> Result<Vec<atoll_kv::MutateInSpec>> {
        let atr = self.atr.as_ref().ok_or_else(|| {
            TransactionError::illegal_state("staging before the ATR entry exists")
        })?;
        Ok(document::staging_specs(
            &self.transaction_id,
            &self.attempt_id,
            atr.keyspace(),
            atr.atr_id(),
            staged,
        ))
    }

    fn doc_record_lists(&self) -> DocRecordLists {
        let mut lists = DocRecordLists::default();
        for staged in &self.staged {
            match staged.mutation_type {
                StagedMutationType::Insert => lists.inserted.push(staged.record.clone()),
                StagedMutationType::Replace => lists.replaced.push(staged.record.clone()),
                StagedMutationType::Remove => lists.removed.push(staged.record.clone()),
            }
        }
        lists
    }

    fn staged_index(&self, record: &DocRecord) -> Option<usize> {
        self.staged.iter().position(|staged| staged.record == *record)
    }

    fn track(
        &mut self,
        record: &DocRecord,
        mutation_type: StagedMutationType,
        cas: Cas,
        content: Option<Value>,
    ) {
        let staged = StagedMutation {
            record: record.clone(),
            mutation_type,
            cas,
            content,
        };
        match self.staged_index(record) {
            Some(index) => self.staged[index] = staged,
            None => self.staged.push(staged),
        }
    }

    async fn collection_for(&self, record: &DocRecord) -> Result<Arc<dyn KvCollection>> {
        Ok(self.cluster.collection(&record.keyspace).await?)
    }

    fn check_expiry(&self, operation: &str) -> Result<()> {
        if Utc::now() >= self.expires_at {
            return Err(TransactionError::expired(format!(
                "{operation} past attempt expiry"
            )));
        }
        Ok(())
    }

    fn check_not_done(&self, operation: &str) -> Result<()> {
        match self.state {
            AttemptState::NothingWritten | AttemptState::Pending => Ok(()),
            state => Err(TransactionError::illegal_state(format!(
                "{operation} on an attempt in state {state}"
            ))),
        }
    }

    /// Another attempt's staging metadata on a document we want to mutate
    /// is a write-write conflict, surfaced before we touch anything.
    fn check_write_write_conflict(&self, doc: &TransactionGetResult) -> Result<()> {
        if let Some(txn) = &doc.txn {
            if txn.staging_version.is_some() && !txn.owned_by(&self.attempt_id) {
                return Err(TransactionError::conflict(format!(
                    "document {} is staged by another attempt",
                    doc.record
                )));
            }
        }
        Ok(())
    }

    fn conflict_on_cas_mismatch(error: TransactionError) -> TransactionError {
        match error {
            TransactionError::Kv(KvError::CasMismatch { id }) => TransactionError::conflict(
                format!("document {id} was modified by a concurrent writer"),
            ),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atoll_core::Keyspace;
    use atoll_kv::MemoryCluster;
    use std::time::Duration;

    fn record(id: &str) -> DocRecord {
        DocRecord::new(Keyspace::default_collection("main"), id)
    }

    fn context(cluster: &MemoryCluster) -> AttemptContext {
        AttemptContext::new(
            Arc::new(cluster.clone()),
            TransactionConfig::default(),
            TransactionId::generate(),
        )
    }

    #[tokio::test]
    async fn attempt_starts_with_nothing_written() {
        let cluster = MemoryCluster::new();
        let ctx = context(&cluster);
        assert_eq!(ctx.state(), AttemptState::NothingWritten);
        assert!(ctx.cleanup_request().is_none());
    }

    #[tokio::test]
    async fn expired_attempt_rejects_operations() {
        let cluster = MemoryCluster::new();
        let mut ctx = AttemptContext::new(
            Arc::new(cluster.clone()),
            TransactionConfig::default().with_expiration(Duration::ZERO),
            TransactionId::generate(),
        );
        let err = ctx.insert(&record("doc"), json!({})).await.unwrap_err();
        assert!(matches!(err, TransactionError::Expired { .. }));
        assert_eq!(err.classify(), ErrorClass::FailExpiry);
    }

    #[tokio::test]
    async fn commit_of_empty_attempt_completes_immediately() {
        let cluster = MemoryCluster::new();
        let mut ctx = context(&cluster);
        ctx.commit().await.unwrap();
        assert_eq!(ctx.state(), AttemptState::Completed);
        assert!(ctx.cleanup_request().is_none());

        // Further mutations are rejected.
        let err = ctx.insert(&record("doc"), json!({})).await.unwrap_err();
        assert!(matches!(err, TransactionError::IllegalState { .. }));
    }

    #[tokio::test]
    async fn first_mutation_creates_pending_atr_entry() {
        let cluster = MemoryCluster::new();
        let mut ctx = context(&cluster);
        ctx.insert(&record("doc"), json!({"n": 1})).await.unwrap();
        assert_eq!(ctx.state(), AttemptState::Pending);

        let request = ctx.cleanup_request().expect("in-flight attempt needs cleanup");
        assert_eq!(request.state(), AttemptState::Pending);
        assert_eq!(request.inserted_ids().len(), 1);

        let atr_xattrs = cluster
            .xattrs(&Keyspace::default_collection("main"), request.atr_id())
            .expect("ATR document exists");
        let entry = &atr_xattrs["attempts"][ctx.attempt_id().to_string()];
        assert_eq!(entry["st"], "PENDING");
        assert!(entry["tst"].is_string());
    }
}
