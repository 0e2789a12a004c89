//! # atoll-core
//!
//! Core abstractions shared across the Atoll transaction stack.
//!
//! This crate provides the foundational types used by every Atoll component:
//!
//! - **Identifiers**: Strongly-typed transaction and attempt ids
//! - **Attempt State**: The closed state machine every attempt moves through
//! - **Keyspace Coordinates**: Weak references to documents by location
//! - **Durability**: Requested replication/persistence guarantees
//! - **Observability**: Logging initialization and span constructors
//!
//! ## Crate Boundary
//!
//! `atoll-core` is the **only** crate allowed to define shared primitives.
//! It has no knowledge of the key-value wire contract (`atoll-kv`) or the
//! transaction protocol (`atoll-txn`).
//!
//! ## Example
//!
//! ```rust
//! use atoll_core::prelude::*;
//!
//! let txn = TransactionId::generate();
//! let attempt = AttemptId::generate();
//! assert_ne!(txn.to_string(), attempt.to_string());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]

pub mod durability;
pub mod error;
pub mod id;
pub mod keyspace;
pub mod observability;
pub mod state;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use atoll_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::durability::DurabilityLevel;
    pub use crate::error::{CoreError, Result};
    pub use crate::id::{AttemptId, TransactionId};
    pub use crate::keyspace::{DocRecord, Keyspace};
    pub use crate::state::AttemptState;
}

// Re-export key types at crate root for ergonomics
pub use durability::DurabilityLevel;
pub use error::{CoreError, Result};
pub use id::{AttemptId, TransactionId};
pub use keyspace::{DocRecord, Keyspace};
pub use observability::{LogFormat, init_logging};
pub use state::AttemptState;
