//! Error types for key-value operations.
//!
//! The variants are deliberately precise: the transaction layer classifies
//! them (conflict vs. staleness vs. transient) and branches on the result,
//! so collapsing them into a generic storage error would lose the
//! information the protocol's idempotence guards depend on.

/// The result type used throughout `atoll-kv`.
pub type Result<T> = std::result::Result<T, KvError>;

/// Errors returned by the key-value collaborator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KvError {
    /// The document does not exist (or is a tombstone and the operation did
    /// not request tombstone access).
    #[error("document not found: {id}")]
    DocumentNotFound {
        /// The document id that was addressed.
        id: String,
    },

    /// The document already exists and the operation required absence.
    #[error("document already exists: {id}")]
    DocumentExists {
        /// The document id that was addressed.
        id: String,
    },

    /// The supplied CAS did not match the document's current version.
    #[error("cas mismatch on document: {id}")]
    CasMismatch {
        /// The document id that was addressed.
        id: String,
    },

    /// A sub-document path does not exist.
    #[error("sub-document path not found: {path}")]
    PathNotFound {
        /// The path that was addressed.
        path: String,
    },

    /// A sub-document path already exists and the spec required absence.
    #[error("sub-document path already exists: {path}")]
    PathExists {
        /// The path that was addressed.
        path: String,
    },

    /// The caller supplied an invalid argument.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },

    /// The operation did not complete within its timeout.
    #[error("operation timed out: {message}")]
    Timeout {
        /// Description of the timed-out operation.
        message: String,
    },

    /// An internal backend failure.
    #[error("internal kv error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
    },
}

impl KvError {
    /// Creates a document-not-found error.
    #[must_use]
    pub fn doc_not_found(id: impl Into<String>) -> Self {
        Self::DocumentNotFound { id: id.into() }
    }

    /// Creates a document-exists error.
    #[must_use]
    pub fn doc_exists(id: impl Into<String>) -> Self {
        Self::DocumentExists { id: id.into() }
    }

    /// Creates a CAS-mismatch error.
    #[must_use]
    pub fn cas_mismatch(id: impl Into<String>) -> Self {
        Self::CasMismatch { id: id.into() }
    }

    /// Creates a path-not-found error.
    #[must_use]
    pub fn path_not_found(path: impl Into<String>) -> Self {
        Self::PathNotFound { path: path.into() }
    }

    /// Creates a path-exists error.
    #[must_use]
    pub fn path_exists(path: impl Into<String>) -> Self {
        Self::PathExists { path: path.into() }
    }

    /// Creates an invalid-argument error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}
