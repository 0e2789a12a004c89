//! The stateless cleanup executor.
//!
//! Given one [`CleanupRequest`], the [`Cleaner`] drives every document the
//! attempt touched to a consistent terminal state, then removes the
//! attempt's ATR entry. Safe to invoke any number of times for the same
//! request: before mutating a document it re-fetches the staging xattrs
//! and skips anything no longer owned by the attempt; crash/retry
//! redelivers the same logical work, and the guard makes redelivery free.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::Instrument as _;

use atoll_core::observability::cleanup_span;
use atoll_core::{AttemptId, AttemptState, DocRecord};
use atoll_kv::{KvCluster, KvCollection, KvError, MutateInOptions, MutateInSpec};

use crate::cleanup::request::{CleanupRequest, TransactionCleanupAttempt};
use crate::document::{self, DocumentLookup};
use crate::error::{ErrorClass, Result, TransactionError};
use crate::fields;
use crate::forwards::{self, InteractionPoint};
use crate::metrics;

/// Why a document was skipped instead of cleaned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The document no longer exists at all.
    DocumentMissing,
    /// The document carries no transaction xattrs.
    NoTransactionMetadata,
    /// The staging metadata belongs to a different attempt; the world
    /// has moved on.
    OwnedByOtherAttempt,
    /// The document's value checksum no longer matches the one recorded
    /// at staging time.
    ContentDiverged,
}

impl SkipReason {
    /// Short label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            SkipReason::DocumentMissing => "document_missing",
            SkipReason::NoTransactionMetadata => "no_transaction_metadata",
            SkipReason::OwnedByOtherAttempt => "owned_by_other_attempt",
            SkipReason::ContentDiverged => "content_diverged",
        }
    }
}

/// Outcome of the per-document guard: act, or treat as already resolved.
///
/// Skips are expected protocol outcomes, not errors; modeling them as a
/// value keeps the hot path allocation-free and the intent explicit.
#[derive(Debug)]
pub enum StagedDocGuard {
    /// The document is unchanged since staging; safe to act on.
    Proceed(DocumentLookup),
    /// The document is already resolved; do not touch it.
    Skip(SkipReason),
}

/// Stateless executor for cleanup requests.
pub struct Cleaner {
    cluster: Arc<dyn KvCluster>,
    kv_timeout: Option<Duration>,
}

impl Cleaner {
    /// Creates a cleaner against a cluster handle.
    #[must_use]
    pub fn new(cluster: Arc<dyn KvCluster>, kv_timeout: Option<Duration>) -> Self {
        Self {
            cluster,
            kv_timeout,
        }
    }

    /// Processes one cleanup request to completion.
    ///
    /// Never returns an error: every failure is captured as the outcome's
    /// `failure_reason`, and the caller decides retry policy.
    pub async fn process_cleanup_request(
        &self,
        request: &CleanupRequest,
        is_regular: bool,
    ) -> TransactionCleanupAttempt {
        tracing::debug!(request = %request, is_regular, "processing cleanup request");
        let span = cleanup_span(
            "process_cleanup_request",
            request.atr_id(),
            &request.attempt_id().to_string(),
        );
        match self.run(request).instrument(span).await {
            Ok(()) => {
                metrics::record_cleanup_attempt(true);
                TransactionCleanupAttempt::succeeded(request, is_regular)
            }
            Err(reason) => {
                tracing::debug!(request = %request, error = %reason, "cleanup failed");
                metrics::record_cleanup_attempt(false);
                TransactionCleanupAttempt::failed(request, is_regular, reason)
            }
        }
    }

    async fn run(&self, request: &CleanupRequest) -> Result<()> {
        if request.atr_id().is_empty() {
            return Err(TransactionError::invalid_argument(
                "cleanup request has an empty atr_id",
            ));
        }

        forwards::check(InteractionPoint::CleanupEntry, request.forward_compatibility())?;
        self.cleanup_docs(request).await?;
        self.cleanup_atr_entry(request).await?;
        Ok(())
    }

    /// Dispatches document-level work on the attempt's last known state.
    ///
    /// The match is exhaustive on purpose: a new state cannot silently
    /// fall through to a default without an explicit decision here.
    async fn cleanup_docs(&self, request: &CleanupRequest) -> Result<()> {
        match request.state() {
            AttemptState::NothingWritten
            | AttemptState::Pending
            | AttemptState::Completed
            | AttemptState::RolledBack
            | AttemptState::Unknown => Ok(()),
            AttemptState::Aborted => self.cleanup_docs_aborted(request).await,
            AttemptState::Committed => self.cleanup_docs_committed(request).await,
        }
    }

    /// Reverts an aborted attempt: staged inserts disappear, replaced and
    /// removed documents are released back to their pre-transaction value.
    async fn cleanup_docs_aborted(&self, request: &CleanupRequest) -> Result<()> {
        for record in request.inserted_ids() {
            let collection = self.cluster.collection(&record.keyspace).await?;
            match self
                .resolve_staged_doc(collection.as_ref(), record, false, request.attempt_id())
                .await?
            {
                StagedDocGuard::Skip(reason) => self.note_skip(record, reason),
                StagedDocGuard::Proceed(op) => {
                    if op.is_tombstone {
                        document::remove_staged_insert(
                            collection.as_ref(),
                            &record.id,
                            op.cas,
                            request.durability_level(),
                            self.kv_timeout,
                        )
                        .await?;
                    } else {
                        document::unstage_remove(
                            collection.as_ref(),
                            &record.id,
                            op.cas,
                            request.durability_level(),
                            self.kv_timeout,
                        )
                        .await?;
                    }
                }
            }
        }

        let replaced_or_removed = request.replaced_ids().iter().chain(request.removed_ids());
        for record in replaced_or_removed {
            let collection = self.cluster.collection(&record.keyspace).await?;
            match self
                .resolve_staged_doc(collection.as_ref(), record, false, request.attempt_id())
                .await?
            {
                StagedDocGuard::Skip(reason) => self.note_skip(record, reason),
                StagedDocGuard::Proceed(op) => {
                    document::clear_transaction_metadata(
                        collection.as_ref(),
                        &record.id,
                        op.cas,
                        op.is_tombstone,
                        request.durability_level(),
                        self.kv_timeout,
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    /// Completes a committed attempt: staged content becomes the real body,
    /// staged removals become physical deletes.
    async fn cleanup_docs_committed(&self, request: &CleanupRequest) -> Result<()> {
        let inserted_or_replaced = request.inserted_ids().iter().chain(request.replaced_ids());
        for record in inserted_or_replaced {
            let collection = self.cluster.collection(&record.keyspace).await?;
            match self
                .resolve_staged_doc(collection.as_ref(), record, true, request.attempt_id())
                .await?
            {
                StagedDocGuard::Skip(reason) => self.note_skip(record, reason),
                StagedDocGuard::Proceed(op) => {
                    let staged = op.staged_content.clone().ok_or_else(|| {
                        TransactionError::illegal_state(format!(
                            "committed document {record} has no staged content"
                        ))
                    })?;
                    document::unstage_insert_or_replace(
                        collection.as_ref(),
                        &record.id,
                        op.cas,
                        staged,
                        op.is_tombstone,
                        request.durability_level(),
                        self.kv_timeout,
                    )
                    .await?;
                }
            }
        }

        for record in request.removed_ids() {
            let collection = self.cluster.collection(&record.keyspace).await?;
            match self
                .resolve_staged_doc(collection.as_ref(), record, true, request.attempt_id())
                .await?
            {
                StagedDocGuard::Skip(reason) => self.note_skip(record, reason),
                StagedDocGuard::Proceed(op) => {
                    document::unstage_remove(
                        collection.as_ref(),
                        &record.id,
                        op.cas,
                        request.durability_level(),
                        self.kv_timeout,
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    /// The idempotence guard: re-fetches the document and decides whether
    /// it is still this attempt's to clean.
    ///
    /// `require_crc_match` is set on the COMMITTED path, where applying
    /// staged content over a body that changed since staging would lose a
    /// newer write. The check only binds when the store reported a current
    /// checksum.
    ///
    /// # Errors
    ///
    /// Propagates collaborator failures other than a missing document.
    pub async fn resolve_staged_doc(
        &self,
        collection: &dyn KvCollection,
        record: &DocRecord,
        require_crc_match: bool,
        attempt_id: &AttemptId,
    ) -> Result<StagedDocGuard> {
        let lookup =
            match document::lookup_document(collection, &record.id, self.kv_timeout, false).await {
                Ok(lookup) => lookup,
                Err(TransactionError::Kv(KvError::DocumentNotFound { .. })) => {
                    return Ok(StagedDocGuard::Skip(SkipReason::DocumentMissing));
                }
                Err(e) => return Err(e),
            };

        let Some(txn) = &lookup.txn else {
            return Ok(StagedDocGuard::Skip(SkipReason::NoTransactionMetadata));
        };
        if !txn.owned_by(attempt_id) {
            return Ok(StagedDocGuard::Skip(SkipReason::OwnedByOtherAttempt));
        }

        if require_crc_match {
            let current = lookup.metadata.as_ref().and_then(|m| m.crc32c.as_deref());
            if let Some(current) = current {
                if txn.crc32.as_deref() != Some(current) {
                    return Ok(StagedDocGuard::Skip(SkipReason::ContentDiverged));
                }
            }
        }

        Ok(StagedDocGuard::Proceed(lookup))
    }

    /// Removes the attempt's `attempts.<id>` subtree from the ATR.
    ///
    /// A request still in `PENDING` first plants the pending sentinel, so
    /// the attempt's own concurrent completion loses the race instead of
    /// resurrecting the entry. A `PathNotFound`-classified failure means
    /// someone already cleaned the entry and is swallowed; anything else
    /// fails the whole pass.
    async fn cleanup_atr_entry(&self, request: &CleanupRequest) -> Result<()> {
        let collection = self.cluster.collection(request.atr_keyspace()).await?;
        let root = fields::atr_entry_root(&request.attempt_id().to_string());

        let mut specs = Vec::with_capacity(2);
        if request.state() == AttemptState::Pending {
            specs.push(
                MutateInSpec::insert(
                    format!("{root}.{}", fields::ATR_FIELD_PENDING_SENTINEL),
                    json!(0),
                )
                .xattr(),
            );
        }
        specs.push(MutateInSpec::remove(&root).xattr());

        let result = collection
            .mutate_in(
                request.atr_id(),
                &specs,
                MutateInOptions::default()
                    .with_durability(request.durability_level())
                    .with_timeout(self.kv_timeout),
            )
            .await;

        match result {
            Ok(result) => {
                if result.token.sequence_number == 0 {
                    tracing::warn!(
                        atr_id = request.atr_id(),
                        attempt_id = %request.attempt_id(),
                        "ATR entry removal was a no-op"
                    );
                } else {
                    tracing::info!(
                        atr_id = request.atr_id(),
                        attempt_id = %request.attempt_id(),
                        "ATR entry cleaned up"
                    );
                }
                Ok(())
            }
            Err(e) => {
                let error = TransactionError::from(e);
                if error.classify() == ErrorClass::FailPathNotFound {
                    tracing::debug!(
                        atr_id = request.atr_id(),
                        attempt_id = %request.attempt_id(),
                        "ATR entry already removed by the time cleanup ran"
                    );
                    return Ok(());
                }
                tracing::warn!(
                    atr_id = request.atr_id(),
                    attempt_id = %request.attempt_id(),
                    error = %error,
                    "failed to clean up ATR entry"
                );
                Err(error)
            }
        }
    }

    fn note_skip(&self, record: &DocRecord, reason: SkipReason) {
        tracing::debug!(doc = %record, reason = reason.as_str(), "skipping already-resolved document");
        metrics::record_cleanup_doc_skipped(reason.as_str());
    }
}
