//! The bounded background cleanup work queue.
//!
//! Decouples cleanup-request discovery from execution:
//!
//! - **Bounded depth** provides backpressure: producers get `false`, never
//!   a block.
//! - **FIFO by arrival** approximates chronological order; producers are
//!   expected to enqueue in roughly-expiry order and nothing enforces it.
//! - **Single consumer**: one cleanup at a time, deliberately, so cleanup
//!   never contends with itself on an ATR or document and resource usage
//!   stays predictable.
//!
//! A failed request is recorded on its own error log and left for the
//! lost-cleanup discovery process to re-find; the queue itself never
//! retries and never stops on a failure.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::cleanup::cleaner::Cleaner;
use crate::cleanup::request::CleanupRequest;
use crate::metrics;

/// Bounded, time-ordered background work queue feeding a [`Cleaner`].
pub struct CleanupWorkQueue {
    sender: Mutex<Option<mpsc::Sender<CleanupRequest>>>,
    passive_rx: Mutex<Option<mpsc::Receiver<CleanupRequest>>>,
    depth: Arc<AtomicUsize>,
    flush_tx: watch::Sender<bool>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl CleanupWorkQueue {
    /// Creates a queue with a fixed capacity ceiling.
    ///
    /// With `run_consumer` the queue spawns its single background consumer
    /// task (requires a tokio runtime); without it the queue only
    /// accumulates, for passive inspection and tests.
    #[must_use]
    pub fn new(cleaner: Arc<Cleaner>, capacity: usize, run_consumer: bool) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let (flush_tx, flush_rx) = watch::channel(false);
        let depth = Arc::new(AtomicUsize::new(0));

        let (consumer, passive_rx) = if run_consumer {
            let handle = tokio::spawn(consumer_loop(
                receiver,
                cleaner,
                Arc::clone(&depth),
                flush_rx,
            ));
            (Some(handle), None)
        } else {
            (None, Some(receiver))
        };

        Self {
            sender: Mutex::new(Some(sender)),
            passive_rx: Mutex::new(passive_rx),
            depth,
            flush_tx,
            consumer: Mutex::new(consumer),
        }
    }

    /// Enqueues a cleanup request without blocking.
    ///
    /// Returns `false` when the queue is full or closed: backpressure the
    /// caller must absorb by dropping or deferring, not by crashing.
    /// Producers are expected to enqueue in roughly-expiry order; the
    /// queue processes in arrival order.
    pub fn try_add_cleanup_request(&self, request: CleanupRequest) -> bool {
        let Ok(guard) = self.sender.lock() else {
            return false;
        };
        let Some(sender) = guard.as_ref() else {
            return false;
        };
        match sender.try_send(request) {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::SeqCst);
                true
            }
            Err(_) => {
                metrics::record_cleanup_queue_rejection();
                false
            }
        }
    }

    /// Current queue depth.
    #[must_use]
    pub fn queue_length(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Drains accumulated requests from a queue whose consumer is
    /// disabled. Returns nothing when a consumer owns the receiver.
    #[must_use]
    pub fn remaining_cleanup_requests(&self) -> Vec<CleanupRequest> {
        let Ok(mut guard) = self.passive_rx.lock() else {
            return Vec::new();
        };
        let Some(receiver) = guard.as_mut() else {
            return Vec::new();
        };
        let mut remaining = Vec::new();
        while let Ok(request) = receiver.try_recv() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            remaining.push(request);
        }
        remaining
    }

    /// Shuts the queue down: closes it to new entries, interrupts any
    /// in-progress readiness delay so the backlog drains immediately, and
    /// awaits the consumer's natural exit. Calling it again is a no-op.
    pub async fn force_flush(&self) {
        let _ = self.flush_tx.send(true);

        // Dropping the sender closes the channel; the consumer drains
        // whatever is buffered, then exits.
        let sender = self.sender.lock().ok().and_then(|mut guard| guard.take());
        drop(sender);

        let handle = self.consumer.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            if handle.await.is_err() {
                tracing::warn!("cleanup consumer task did not exit cleanly");
            }
        }
    }
}

/// The single background consumer: pull, wait out readiness, process.
async fn consumer_loop(
    mut receiver: mpsc::Receiver<CleanupRequest>,
    cleaner: Arc<Cleaner>,
    depth: Arc<AtomicUsize>,
    mut flush_rx: watch::Receiver<bool>,
) {
    while let Some(request) = receiver.recv().await {
        depth.fetch_sub(1, Ordering::SeqCst);

        let delay = request
            .when_ready_to_be_processed()
            .signed_duration_since(Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        if !delay.is_zero() && !*flush_rx.borrow() {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = flush_rx.wait_for(|flushed| *flushed) => {
                    tracing::debug!(request = %request, "readiness delay interrupted by force flush");
                }
            }
        }

        let attempt = cleaner.process_cleanup_request(&request, true).await;
        if !attempt.success {
            if let Some(reason) = attempt.failure_reason {
                tracing::warn!(
                    request = %request,
                    error = %reason,
                    "cleanup request failed; leaving it for lost-cleanup discovery"
                );
                request.record_processing_error(reason);
            }
        }
    }
    tracing::debug!("cleanup work queue consumer exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    use atoll_core::{AttemptId, AttemptState, DurabilityLevel, Keyspace};
    use atoll_kv::MemoryCluster;

    fn cleaner() -> Arc<Cleaner> {
        Arc::new(Cleaner::new(Arc::new(MemoryCluster::new()), None))
    }

    fn request(atr_id: &str) -> CleanupRequest {
        CleanupRequest::new(
            Keyspace::default_collection("main"),
            atr_id,
            AttemptId::generate(),
            AttemptState::NothingWritten,
            vec![],
            vec![],
            vec![],
            Utc::now(),
            None,
            DurabilityLevel::Majority,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn rejects_when_full_without_blocking() {
        let queue = CleanupWorkQueue::new(cleaner(), 2, false);
        assert!(queue.try_add_cleanup_request(request("_txn:atr-1")));
        assert!(queue.try_add_cleanup_request(request("_txn:atr-2")));
        assert!(!queue.try_add_cleanup_request(request("_txn:atr-3")));
        assert_eq!(queue.queue_length(), 2);
    }

    #[tokio::test]
    async fn rejects_after_force_flush() {
        let queue = CleanupWorkQueue::new(cleaner(), 8, true);
        queue.force_flush().await;
        assert!(!queue.try_add_cleanup_request(request("_txn:atr-1")));

        // Double shutdown is tolerated.
        queue.force_flush().await;
    }

    #[tokio::test]
    async fn passive_queue_exposes_remaining_requests() {
        let queue = CleanupWorkQueue::new(cleaner(), 8, false);
        assert!(queue.try_add_cleanup_request(request("_txn:atr-1")));
        assert!(queue.try_add_cleanup_request(request("_txn:atr-2")));

        let remaining = queue.remaining_cleanup_requests();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].atr_id(), "_txn:atr-1");
        assert_eq!(queue.queue_length(), 0);
    }
}
