//! Cleanup work items and their outcome records.

use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use atoll_core::{AttemptId, AttemptState, DocRecord, DurabilityLevel, Keyspace};

use crate::error::{Result, TransactionError};
use crate::forwards::ForwardCompatibility;

/// An immutable work item describing one ATR attempt needing cleanup.
///
/// Created when a cleanup need is discovered (inline after a finished
/// attempt, or by lost-transaction detection) and dropped once consumed
/// from the work queue. The durable source of truth stays in the ATR and
/// the documents' xattrs; losing a request only delays cleanup until the
/// attempt is re-found.
#[derive(Debug, Clone)]
pub struct CleanupRequest {
    atr_keyspace: Keyspace,
    atr_id: String,
    attempt_id: AttemptId,
    state: AttemptState,
    inserted_ids: Vec<DocRecord>,
    replaced_ids: Vec<DocRecord>,
    removed_ids: Vec<DocRecord>,
    when_ready_to_be_processed: DateTime<Utc>,
    forward_compatibility: Option<ForwardCompatibility>,
    durability: DurabilityLevel,
    processing_errors: Arc<Mutex<Vec<TransactionError>>>,
}

impl CleanupRequest {
    /// Creates a cleanup request.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when `atr_id` is empty: a request without an ATR
    /// is a programmer error, rejected at construction rather than retried
    /// later.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        atr_keyspace: Keyspace,
        atr_id: impl Into<String>,
        attempt_id: AttemptId,
        state: AttemptState,
        inserted_ids: Vec<DocRecord>,
        replaced_ids: Vec<DocRecord>,
        removed_ids: Vec<DocRecord>,
        when_ready_to_be_processed: DateTime<Utc>,
        forward_compatibility: Option<ForwardCompatibility>,
        durability: DurabilityLevel,
    ) -> Result<Self> {
        let atr_id = atr_id.into();
        if atr_id.is_empty() {
            return Err(TransactionError::invalid_argument(
                "cleanup request requires a non-empty atr_id",
            ));
        }
        Ok(Self {
            atr_keyspace,
            atr_id,
            attempt_id,
            state,
            inserted_ids,
            replaced_ids,
            removed_ids,
            when_ready_to_be_processed,
            forward_compatibility,
            durability,
            processing_errors: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Keyspace of the ATR document.
    #[must_use]
    pub fn atr_keyspace(&self) -> &Keyspace {
        &self.atr_keyspace
    }

    /// Id of the ATR document.
    #[must_use]
    pub fn atr_id(&self) -> &str {
        &self.atr_id
    }

    /// The attempt this request cleans up after.
    #[must_use]
    pub fn attempt_id(&self) -> &AttemptId {
        &self.attempt_id
    }

    /// Attempt state at the time the request was created.
    #[must_use]
    pub fn state(&self) -> AttemptState {
        self.state
    }

    /// Documents the attempt staged as inserts.
    #[must_use]
    pub fn inserted_ids(&self) -> &[DocRecord] {
        &self.inserted_ids
    }

    /// Documents the attempt staged as replaces.
    #[must_use]
    pub fn replaced_ids(&self) -> &[DocRecord] {
        &self.replaced_ids
    }

    /// Documents the attempt staged as removes.
    #[must_use]
    pub fn removed_ids(&self) -> &[DocRecord] {
        &self.removed_ids
    }

    /// Earliest time the request should be processed.
    #[must_use]
    pub fn when_ready_to_be_processed(&self) -> DateTime<Utc> {
        self.when_ready_to_be_processed
    }

    /// Forward-compatibility requirements recorded for this attempt.
    #[must_use]
    pub fn forward_compatibility(&self) -> Option<&ForwardCompatibility> {
        self.forward_compatibility.as_ref()
    }

    /// Durability level cleanup mutations should use.
    #[must_use]
    pub fn durability_level(&self) -> DurabilityLevel {
        self.durability
    }

    /// Records a failed processing pass. Thread-safe; clones of this
    /// request share the same error log.
    pub fn record_processing_error(&self, error: TransactionError) {
        if let Ok(mut errors) = self.processing_errors.lock() {
            errors.push(error);
        }
    }

    /// Errors accumulated across failed processing passes.
    #[must_use]
    pub fn processing_errors(&self) -> Vec<TransactionError> {
        self.processing_errors
            .lock()
            .map(|errors| errors.clone())
            .unwrap_or_default()
    }
}

impl fmt::Display for CleanupRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} attempt={} state={} ins={} rep={} rem={}",
            self.atr_keyspace,
            self.atr_id,
            self.attempt_id,
            self.state,
            self.inserted_ids.len(),
            self.replaced_ids.len(),
            self.removed_ids.len(),
        )
    }
}

/// The outcome record of one cleanup pass over one request.
#[derive(Debug, Clone)]
pub struct TransactionCleanupAttempt {
    /// Whether the pass completed every step.
    pub success: bool,
    /// Whether the pass was scheduled (queue-driven) or ad-hoc.
    pub is_regular: bool,
    /// The attempt that was cleaned up.
    pub attempt_id: AttemptId,
    /// The ATR document id.
    pub atr_id: String,
    /// The ATR document's keyspace.
    pub atr_keyspace: Keyspace,
    /// Why the pass failed. Present iff `success` is false.
    pub failure_reason: Option<TransactionError>,
}

impl TransactionCleanupAttempt {
    /// Builds a successful outcome for `request`.
    #[must_use]
    pub fn succeeded(request: &CleanupRequest, is_regular: bool) -> Self {
        Self {
            success: true,
            is_regular,
            attempt_id: request.attempt_id,
            atr_id: request.atr_id.clone(),
            atr_keyspace: request.atr_keyspace.clone(),
            failure_reason: None,
        }
    }

    /// Builds a failed outcome for `request`.
    #[must_use]
    pub fn failed(request: &CleanupRequest, is_regular: bool, reason: TransactionError) -> Self {
        Self {
            success: false,
            is_regular,
            attempt_id: request.attempt_id,
            atr_id: request.atr_id.clone(),
            atr_keyspace: request.atr_keyspace.clone(),
            failure_reason: Some(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CleanupRequest {
        CleanupRequest::new(
            Keyspace::default_collection("main"),
            "_txn:atr-1",
            AttemptId::generate(),
            AttemptState::Aborted,
            vec![],
            vec![],
            vec![],
            Utc::now(),
            None,
            DurabilityLevel::Majority,
        )
        .unwrap()
    }

    #[test]
    fn empty_atr_id_is_rejected() {
        let err = CleanupRequest::new(
            Keyspace::default_collection("main"),
            "",
            AttemptId::generate(),
            AttemptState::Aborted,
            vec![],
            vec![],
            vec![],
            Utc::now(),
            None,
            DurabilityLevel::Majority,
        )
        .unwrap_err();
        assert!(matches!(err, TransactionError::InvalidArgument { .. }));
    }

    #[test]
    fn processing_errors_are_shared_across_clones() {
        let request = request();
        let clone = request.clone();
        clone.record_processing_error(TransactionError::conflict("pass 1"));
        assert_eq!(request.processing_errors().len(), 1);
    }

    #[test]
    fn outcome_mirrors_request_fields() {
        let request = request();
        let outcome = TransactionCleanupAttempt::succeeded(&request, true);
        assert!(outcome.success);
        assert!(outcome.failure_reason.is_none());
        assert_eq!(outcome.atr_id, request.atr_id());

        let outcome = TransactionCleanupAttempt::failed(
            &request,
            false,
            TransactionError::conflict("boom"),
        );
        assert!(!outcome.success);
        assert!(outcome.failure_reason.is_some());
        assert!(!outcome.is_regular);
    }
}
