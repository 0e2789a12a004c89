//! The per-cluster-session transaction owner.
//!
//! One [`Transactions`] object is constructed per cluster connection and
//! owns that connection's cleanup resources: an explicitly injected
//! [`Cleaner`] + [`CleanupWorkQueue`] pair, never process-wide state, so
//! independent connections in one process never share cleanup queues.

use std::sync::Arc;

use atoll_core::TransactionId;
use atoll_kv::KvCluster;

use crate::attempt::AttemptContext;
use crate::cleanup::cleaner::Cleaner;
use crate::cleanup::queue::CleanupWorkQueue;
use crate::cleanup::request::TransactionCleanupAttempt;
use crate::config::TransactionConfig;

/// A transactions session bound to one cluster connection.
///
/// Must be created inside a tokio runtime when client-attempt cleanup is
/// enabled (the queue spawns its consumer task at construction). Call
/// [`shutdown`](Self::shutdown) before dropping to drain pending cleanup
/// immediately instead of abandoning it to lost-cleanup discovery.
pub struct Transactions {
    cluster: Arc<dyn KvCluster>,
    config: TransactionConfig,
    cleaner: Arc<Cleaner>,
    cleanup_work_queue: CleanupWorkQueue,
}

impl Transactions {
    /// Creates a session against a cluster handle.
    #[must_use]
    pub fn new(cluster: Arc<dyn KvCluster>, config: TransactionConfig) -> Self {
        let cleaner = Arc::new(Cleaner::new(Arc::clone(&cluster), config.kv_timeout));
        let cleanup_work_queue = CleanupWorkQueue::new(
            Arc::clone(&cleaner),
            config.cleanup.queue_capacity,
            config.cleanup.cleanup_client_attempts,
        );
        Self {
            cluster,
            config,
            cleaner,
            cleanup_work_queue,
        }
    }

    /// The session configuration.
    #[must_use]
    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Starts a fresh logical transaction's first attempt.
    #[must_use]
    pub fn new_attempt(&self) -> AttemptContext {
        self.attempt_for(TransactionId::generate())
    }

    /// Starts another attempt of an existing logical transaction (retry).
    #[must_use]
    pub fn attempt_for(&self, transaction_id: TransactionId) -> AttemptContext {
        AttemptContext::new(
            Arc::clone(&self.cluster),
            self.config.clone(),
            transaction_id,
        )
    }

    /// Enqueues the cleanup work a finished attempt left behind, if any.
    ///
    /// Returns `false` when the attempt needed cleanup but the queue
    /// rejected it (backpressure). The work is not lost, only deferred to
    /// lost-cleanup discovery, so callers log rather than fail.
    pub fn add_cleanup_request(&self, ctx: &AttemptContext) -> bool {
        let Some(request) = ctx.cleanup_request() else {
            return true;
        };
        tracing::debug!(request = %request, "adding cleanup request");
        if !self.cleanup_work_queue.try_add_cleanup_request(request) {
            tracing::warn!(
                attempt_id = %ctx.attempt_id(),
                "failed to add background cleanup request; leaving for lost cleanup"
            );
            return false;
        }
        true
    }

    /// Current cleanup queue depth.
    #[must_use]
    pub fn cleanup_queue_length(&self) -> usize {
        self.cleanup_work_queue.queue_length()
    }

    /// Processes whatever is sitting in a passive (consumer-disabled)
    /// queue, returning each pass's outcome. Useful for tests and for
    /// sessions that drive cleanup on their own schedule.
    pub async fn cleanup_attempts(&self) -> Vec<TransactionCleanupAttempt> {
        let mut outcomes = Vec::new();
        for request in self.cleanup_work_queue.remaining_cleanup_requests() {
            outcomes.push(self.cleaner.process_cleanup_request(&request, true).await);
        }
        outcomes
    }

    /// Shuts the cleanup subsystem down: pending requests are processed
    /// immediately (scheduled delays are cancelled) and the consumer task
    /// is awaited to its natural exit.
    pub async fn shutdown(&self) {
        self.cleanup_work_queue.force_flush().await;
    }
}
