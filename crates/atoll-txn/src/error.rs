//! Error types for the transaction core.
//!
//! Expected protocol outcomes (staleness, already-cleaned, read-your-writes
//! misses) are modeled as result values, not errors. What remains here is
//! what a caller genuinely has to react to: conflicts (retry the attempt),
//! expiry, contract violations, and collaborator failures.

use atoll_kv::KvError;

/// The result type used throughout `atoll-txn`.
pub type Result<T> = std::result::Result<T, TransactionError>;

/// Errors surfaced by the transaction core.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransactionError {
    /// A concurrent writer moved a document between read and staging.
    /// Retryable at the attempt level; never swallowed internally.
    #[error("conflict: {message}")]
    Conflict {
        /// Human-readable conflict details.
        message: String,
    },

    /// The attempt exceeded its expiry while still in flight.
    #[error("attempt expired: {message}")]
    Expired {
        /// Human-readable expiry details.
        message: String,
    },

    /// The metadata requires a protocol extension this client lacks.
    #[error("forward compatibility failure: requires '{requirement}'")]
    ForwardCompatibilityFailure {
        /// The extension or protocol version that is not supported.
        requirement: String,
    },

    /// The ATR entry could not be written because the ATR is full.
    #[error("active transaction record is full: {atr_id}")]
    AtrFull {
        /// The ATR document id.
        atr_id: String,
    },

    /// A caller violated the API contract.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the violation.
        message: String,
    },

    /// The attempt was driven through an illegal state transition.
    #[error("illegal state: {message}")]
    IllegalState {
        /// Description of the violation.
        message: String,
    },

    /// A key-value operation failed.
    #[error(transparent)]
    Kv(#[from] KvError),
}

impl TransactionError {
    /// Creates a conflict error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Creates an expired error.
    #[must_use]
    pub fn expired(message: impl Into<String>) -> Self {
        Self::Expired {
            message: message.into(),
        }
    }

    /// Creates an invalid-argument error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an illegal-state error.
    #[must_use]
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    /// Classifies the error for dispatch decisions.
    #[must_use]
    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::Conflict { .. } => ErrorClass::FailCasMismatch,
            Self::Expired { .. } => ErrorClass::FailExpiry,
            Self::ForwardCompatibilityFailure { .. } => ErrorClass::FailOther,
            Self::AtrFull { .. } => ErrorClass::FailAtrFull,
            Self::InvalidArgument { .. } | Self::IllegalState { .. } => ErrorClass::FailOther,
            Self::Kv(kv) => match kv {
                KvError::DocumentNotFound { .. } => ErrorClass::FailDocNotFound,
                KvError::DocumentExists { .. } => ErrorClass::FailDocAlreadyExists,
                KvError::CasMismatch { .. } => ErrorClass::FailCasMismatch,
                KvError::PathNotFound { .. } => ErrorClass::FailPathNotFound,
                KvError::PathExists { .. } => ErrorClass::FailPathAlreadyExists,
                KvError::Timeout { .. } => ErrorClass::FailTransient,
                KvError::InvalidArgument { .. } | KvError::Internal { .. } => ErrorClass::FailOther,
            },
        }
    }
}

/// Coarse classification of failures, used for dispatch: which failures are
/// tolerable staleness, which are transient, which are hard stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The document does not exist.
    FailDocNotFound,
    /// The document already exists.
    FailDocAlreadyExists,
    /// A CAS precondition failed.
    FailCasMismatch,
    /// A sub-document path does not exist.
    FailPathNotFound,
    /// A sub-document path already exists.
    FailPathAlreadyExists,
    /// A transient infrastructure failure (timeout, network); worth a
    /// later retry, never an immediate one.
    FailTransient,
    /// The operation may or may not have been applied.
    FailAmbiguous,
    /// The attempt exceeded its expiry.
    FailExpiry,
    /// The ATR document cannot take more entries.
    FailAtrFull,
    /// A non-recoverable failure; do not retry, do not roll back further.
    FailHard,
    /// Anything else.
    FailOther,
}
