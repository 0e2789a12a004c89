//! The asynchronous cleanup subsystem.
//!
//! An attempt that crashes, expires, or fails mid-protocol leaves staged
//! documents and an ATR entry behind. Cleanup reconciles them: a
//! [`request::CleanupRequest`] describes one attempt needing attention, the
//! [`queue::CleanupWorkQueue`] paces and serializes delivery, and the
//! [`cleaner::Cleaner`] drives the documents to a consistent terminal state
//! before removing the ATR entry.
//!
//! Every step is idempotent: the same request can be processed any number
//! of times, by this client or another, without double-applying.

pub mod cleaner;
pub mod queue;
pub mod request;
