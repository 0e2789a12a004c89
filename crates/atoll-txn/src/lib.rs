//! # atoll-txn
//!
//! Client-side distributed ACID transactions over a document key-value
//! store, without a central transaction coordinator:
//!
//! - **Staged mutations**: an attempt's intended writes are hidden in each
//!   document's `txn.*` xattrs, guarded by per-document CAS, and only made
//!   visible at commit.
//! - **Active Transaction Record (ATR)**: one shard-assigned document holds
//!   an append-only map of attempt entries; its `st` field is the single
//!   source of truth for an attempt's outcome.
//! - **Asynchronous cleanup**: a background queue + stateless [`Cleaner`]
//!   reconcile documents and ATR entries left behind by crashed or
//!   abandoned attempts, idempotently.
//!
//! ```text
//! AttemptContext ──stage──▶ doc xattrs + ATR entry (PENDING)
//!       │ commit                       │ crash / expiry
//!       ▼                              ▼
//!  ATR COMMITTED ──unstage──▶     CleanupRequest
//!       │                              │
//!       ▼                              ▼
//!  ATR entry removed         CleanupWorkQueue ──▶ Cleaner
//! ```
//!
//! The crate is generic over the [`atoll_kv`] collaborator traits; tests
//! run hermetically against `atoll_kv::MemoryCluster`.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]

pub mod atr;
pub mod attempt;
pub mod cleanup;
pub mod config;
pub mod document;
pub mod error;
pub mod fields;
pub mod forwards;
pub mod metrics;
pub mod transactions;

pub use atr::{AtrEntry, AtrRecord};
pub use attempt::{AttemptContext, StagedMutation, StagedMutationType, TransactionGetResult};
pub use cleanup::cleaner::{Cleaner, SkipReason, StagedDocGuard};
pub use cleanup::queue::CleanupWorkQueue;
pub use cleanup::request::{CleanupRequest, TransactionCleanupAttempt};
pub use config::{CleanupConfig, TransactionConfig};
pub use error::{ErrorClass, Result, TransactionError};
pub use forwards::ForwardCompatibility;
pub use transactions::Transactions;
