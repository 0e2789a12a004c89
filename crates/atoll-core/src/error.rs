//! Error types and result aliases for Atoll primitives.

/// The result type used by `atoll-core`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur constructing or parsing core primitives.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the id invalid.
        message: String,
    },

    /// An invalid keyspace path was provided.
    #[error("invalid keyspace: {message}")]
    InvalidKeyspace {
        /// Description of what made the keyspace invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a new invalid-id error.
    #[must_use]
    pub fn invalid_id(message: impl Into<String>) -> Self {
        Self::InvalidId {
            message: message.into(),
        }
    }

    /// Creates a new invalid-keyspace error.
    #[must_use]
    pub fn invalid_keyspace(message: impl Into<String>) -> Self {
        Self::InvalidKeyspace {
            message: message.into(),
        }
    }
}
