//! Transaction metrics.
//!
//! Cleanup is invisible to applications by design, so counters are the
//! only way operators see it working. These complement the structured
//! logging already in place.

use metrics::{counter, describe_counter};

/// Cleanup passes, labeled by outcome.
pub const CLEANUP_ATTEMPTS: &str = "atoll_cleanup_attempts_total";

/// Documents skipped by the idempotence guard, labeled by reason.
pub const CLEANUP_DOCS_SKIPPED: &str = "atoll_cleanup_docs_skipped_total";

/// Cleanup requests rejected by queue backpressure.
pub const CLEANUP_QUEUE_REJECTED: &str = "atoll_cleanup_queue_rejected_total";

/// Registers all metric descriptions.
///
/// Call once at application startup after installing a metrics recorder.
pub fn register_metrics() {
    describe_counter!(CLEANUP_ATTEMPTS, "Total cleanup passes by outcome");
    describe_counter!(
        CLEANUP_DOCS_SKIPPED,
        "Documents skipped by the cleanup idempotence guard"
    );
    describe_counter!(
        CLEANUP_QUEUE_REJECTED,
        "Cleanup requests rejected by queue backpressure"
    );
}

/// Records one cleanup pass.
pub fn record_cleanup_attempt(success: bool) {
    let outcome = if success { "success" } else { "failure" };
    counter!(CLEANUP_ATTEMPTS, "outcome" => outcome).increment(1);
}

/// Records a document skipped by the idempotence guard.
pub fn record_cleanup_doc_skipped(reason: &'static str) {
    counter!(CLEANUP_DOCS_SKIPPED, "reason" => reason).increment(1);
}

/// Records a queue backpressure rejection.
pub fn record_cleanup_queue_rejection() {
    counter!(CLEANUP_QUEUE_REJECTED).increment(1);
}
