//! Cleanup work queue behavior: backpressure, readiness delays, force
//! flush, and failure isolation.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use atoll_core::{AttemptId, AttemptState, DocRecord, DurabilityLevel, Keyspace};
use atoll_kv::{KvCluster, MemoryCluster, MutateInOptions, MutateInSpec, StoreSemantics};
use atoll_txn::{Cleaner, CleanupRequest, CleanupWorkQueue};

fn keyspace() -> Keyspace {
    Keyspace::default_collection("main")
}

fn cleaner(cluster: &MemoryCluster) -> Arc<Cleaner> {
    Arc::new(Cleaner::new(Arc::new(cluster.clone()), None))
}

/// Seeds an ATR document with one attempt entry and returns a request that
/// removes it when processed.
async fn seeded_request(
    cluster: &MemoryCluster,
    atr_id: &str,
    ready_in: chrono::Duration,
) -> CleanupRequest {
    let attempt_id = AttemptId::generate();
    let collection = cluster.collection(&keyspace()).await.unwrap();
    collection
        .mutate_in(
            atr_id,
            &[MutateInSpec::upsert(format!("attempts.{attempt_id}.st"), json!("PENDING"))
                .xattr()
                .create_path()],
            MutateInOptions::default().with_store_semantics(StoreSemantics::Upsert),
        )
        .await
        .unwrap();

    CleanupRequest::new(
        keyspace(),
        atr_id,
        attempt_id,
        AttemptState::Pending,
        vec![],
        vec![],
        vec![],
        Utc::now() + ready_in,
        None,
        DurabilityLevel::Majority,
    )
    .unwrap()
}

fn atr_entry_exists(cluster: &MemoryCluster, atr_id: &str, attempt_id: &AttemptId) -> bool {
    cluster
        .xattrs(&keyspace(), atr_id)
        .and_then(|xattrs| {
            xattrs["attempts"]
                .as_object()
                .map(|attempts| attempts.contains_key(&attempt_id.to_string()))
        })
        .unwrap_or(false)
}

#[tokio::test]
async fn backpressure_rejects_at_capacity_without_blocking() {
    let cluster = MemoryCluster::new();
    let queue = CleanupWorkQueue::new(cleaner(&cluster), 3, false);

    for i in 0..3 {
        let request = seeded_request(&cluster, &format!("_txn:atr-{i}"), chrono::Duration::zero()).await;
        assert!(queue.try_add_cleanup_request(request));
    }
    let overflow = seeded_request(&cluster, "_txn:atr-overflow", chrono::Duration::zero()).await;
    assert!(!queue.try_add_cleanup_request(overflow));
    assert_eq!(queue.queue_length(), 3);
}

#[tokio::test]
async fn consumer_processes_ready_requests() {
    let cluster = MemoryCluster::new();
    let queue = CleanupWorkQueue::new(cleaner(&cluster), 16, true);

    let request = seeded_request(&cluster, "_txn:atr-1", chrono::Duration::zero()).await;
    let attempt_id = *request.attempt_id();
    assert!(queue.try_add_cleanup_request(request));

    // Single consumer, no scheduled delay: the entry disappears shortly.
    let mut cleaned = false;
    for _ in 0..50 {
        if !atr_entry_exists(&cluster, "_txn:atr-1", &attempt_id) {
            cleaned = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(cleaned, "consumer should process a ready request promptly");
    queue.force_flush().await;
}

#[tokio::test]
async fn consumer_waits_out_readiness_delay() {
    let cluster = MemoryCluster::new();
    let queue = CleanupWorkQueue::new(cleaner(&cluster), 16, true);

    let request = seeded_request(&cluster, "_txn:atr-1", chrono::Duration::milliseconds(400)).await;
    let attempt_id = *request.attempt_id();
    assert!(queue.try_add_cleanup_request(request));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        atr_entry_exists(&cluster, "_txn:atr-1", &attempt_id),
        "request must not be processed before its readiness time"
    );

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(
        !atr_entry_exists(&cluster, "_txn:atr-1", &attempt_id),
        "request must be processed after its readiness time"
    );
    queue.force_flush().await;
}

#[tokio::test]
async fn force_flush_drains_scheduled_requests_immediately() {
    let cluster = MemoryCluster::new();
    let queue = CleanupWorkQueue::new(cleaner(&cluster), 16, true);

    // Scheduled an hour out: only flush cancellation can process it now.
    let request = seeded_request(&cluster, "_txn:atr-1", chrono::Duration::hours(1)).await;
    let attempt_id = *request.attempt_id();
    assert!(queue.try_add_cleanup_request(request));

    queue.force_flush().await;

    assert!(
        !atr_entry_exists(&cluster, "_txn:atr-1", &attempt_id),
        "force flush must process requests without waiting out their delay"
    );
    assert!(!queue.try_add_cleanup_request(
        seeded_request(&cluster, "_txn:atr-2", chrono::Duration::zero()).await
    ));
}

#[tokio::test]
async fn one_failed_request_does_not_stop_the_consumer() {
    let cluster = MemoryCluster::new();
    let queue = CleanupWorkQueue::new(cleaner(&cluster), 16, true);

    // First request targets a missing ATR document and fails; the second
    // is valid and must still be processed.
    let failing = CleanupRequest::new(
        keyspace(),
        "_txn:atr-missing",
        AttemptId::generate(),
        AttemptState::Completed,
        vec![],
        vec![],
        vec![],
        Utc::now(),
        None,
        DurabilityLevel::Majority,
    )
    .unwrap();
    let ok = seeded_request(&cluster, "_txn:atr-ok", chrono::Duration::zero()).await;
    let ok_attempt = *ok.attempt_id();

    assert!(queue.try_add_cleanup_request(failing.clone()));
    assert!(queue.try_add_cleanup_request(ok));
    queue.force_flush().await;

    assert!(!atr_entry_exists(&cluster, "_txn:atr-ok", &ok_attempt));
    // The failure was recorded on the request's own error log.
    assert!(!failing.processing_errors().is_empty());
}

#[tokio::test]
async fn processing_skips_documents_it_does_not_own() {
    // End-to-end sanity: a queued ABORTED request against a document staged
    // by someone else must succeed without touching it.
    let cluster = MemoryCluster::new();
    let collection = cluster.collection(&keyspace()).await.unwrap();
    let other_attempt = AttemptId::generate();
    collection
        .mutate_in(
            "doc-a",
            &[
                MutateInSpec::upsert("txn.ver", json!(other_attempt.to_string()))
                    .xattr()
                    .create_path(),
            ],
            MutateInOptions::default()
                .with_store_semantics(StoreSemantics::Insert)
                .with_create_as_deleted(),
        )
        .await
        .unwrap();

    let queue = CleanupWorkQueue::new(cleaner(&cluster), 16, true);
    let mut request = seeded_request(&cluster, "_txn:atr-1", chrono::Duration::zero()).await;
    request = CleanupRequest::new(
        keyspace(),
        "_txn:atr-1",
        *request.attempt_id(),
        AttemptState::Aborted,
        vec![DocRecord::new(keyspace(), "doc-a")],
        vec![],
        vec![],
        Utc::now(),
        None,
        DurabilityLevel::Majority,
    )
    .unwrap();
    assert!(queue.try_add_cleanup_request(request));
    queue.force_flush().await;

    let xattrs = cluster.xattrs(&keyspace(), "doc-a").unwrap();
    assert_eq!(xattrs["txn"]["ver"], json!(other_attempt.to_string()));
}
