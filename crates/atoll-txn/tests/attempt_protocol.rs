//! The staged-mutation protocol end to end: staging invisibility,
//! read-your-writes, conflict surfacing, commit unstaging, rollback, and
//! the session-level cleanup handoff.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use serde_json::json;

use atoll_core::{AttemptState, DocRecord, Keyspace};
use atoll_kv::{
    InsertOptions, KvCluster, KvError, MemoryCluster, MutateInOptions, MutateInSpec,
    StoreSemantics,
};
use atoll_txn::config::CleanupConfig;
use atoll_txn::{TransactionConfig, TransactionError, Transactions};

fn keyspace() -> Keyspace {
    Keyspace::default_collection("main")
}

fn record(id: &str) -> DocRecord {
    DocRecord::new(keyspace(), id)
}

fn session(cluster: &MemoryCluster) -> Transactions {
    Transactions::new(
        Arc::new(cluster.clone()),
        TransactionConfig::default()
            .with_cleanup(CleanupConfig::default().with_cleanup_client_attempts(false)),
    )
}

#[tokio::test]
async fn staged_insert_is_invisible_until_commit() {
    let cluster = MemoryCluster::new();
    let collection = cluster.collection(&keyspace()).await.unwrap();
    let session = session(&cluster);
    let mut ctx = session.new_attempt();

    ctx.insert(&record("doc"), json!({"n": 1})).await.unwrap();

    // Invisible to plain reads, visible to the attempt itself.
    assert!(matches!(
        collection.get("doc").await.unwrap_err(),
        KvError::DocumentNotFound { .. }
    ));
    let own = ctx.get(&record("doc")).await.unwrap().expect("read-your-writes");
    assert_eq!(own.content, json!({"n": 1}));

    ctx.commit().await.unwrap();
    assert_eq!(ctx.state(), AttemptState::Completed);
    assert!(ctx.unstaging_complete());

    // Now visible, with no staging metadata left behind.
    assert_eq!(collection.get("doc").await.unwrap().content, json!({"n": 1}));
    assert_eq!(cluster.xattrs(&keyspace(), "doc"), Some(json!({})));
    assert!(ctx.cleanup_request().is_none());
}

#[tokio::test]
async fn staging_writes_the_protocol_xattrs() {
    let cluster = MemoryCluster::new();
    let collection = cluster.collection(&keyspace()).await.unwrap();
    collection
        .insert("doc", json!({"v": 1}), InsertOptions::default())
        .await
        .unwrap();

    let session = session(&cluster);
    let mut ctx = session.new_attempt();
    let doc = ctx.get(&record("doc")).await.unwrap().unwrap();
    ctx.replace(&doc, json!({"v": 2})).await.unwrap();

    let xattrs = cluster.xattrs(&keyspace(), "doc").unwrap();
    let txn = &xattrs["txn"];
    assert_eq!(txn["id"], json!(ctx.transaction_id().to_string()));
    assert_eq!(txn["ver"], json!(ctx.attempt_id().to_string()));
    assert_eq!(txn["staged"], json!({"v": 2}));
    assert_eq!(txn["atr_bkt"], json!("main"));
    assert!(txn["atr_id"].as_str().unwrap().starts_with("_txn:atr-"));
    assert!(txn["crc32"].is_string());

    // The body is untouched while staged.
    assert_eq!(collection.get("doc").await.unwrap().content, json!({"v": 1}));
}

#[tokio::test]
async fn commit_unstages_replaces_and_removes() {
    let cluster = MemoryCluster::new();
    let collection = cluster.collection(&keyspace()).await.unwrap();
    collection
        .insert("doc-rep", json!({"v": 1}), InsertOptions::default())
        .await
        .unwrap();
    collection
        .insert("doc-rem", json!({"v": 1}), InsertOptions::default())
        .await
        .unwrap();

    let session = session(&cluster);
    let mut ctx = session.new_attempt();
    let rep = ctx.get(&record("doc-rep")).await.unwrap().unwrap();
    ctx.replace(&rep, json!({"v": 2})).await.unwrap();
    let rem = ctx.get(&record("doc-rem")).await.unwrap().unwrap();
    ctx.remove(&rem).await.unwrap();

    // Staged removal reads as absent within the attempt.
    assert!(ctx.get(&record("doc-rem")).await.unwrap().is_none());

    let atr_id = ctx.cleanup_request().unwrap().atr_id().to_string();
    ctx.commit().await.unwrap();
    assert_eq!(ctx.state(), AttemptState::Completed);

    assert_eq!(
        collection.get("doc-rep").await.unwrap().content,
        json!({"v": 2})
    );
    assert_eq!(cluster.xattrs(&keyspace(), "doc-rep"), Some(json!({})));
    assert!(matches!(
        collection.get("doc-rem").await.unwrap_err(),
        KvError::DocumentNotFound { .. }
    ));

    // The attempt's ATR entry is gone.
    let atr_xattrs = cluster.xattrs(&keyspace(), &atr_id).unwrap();
    assert!(
        atr_xattrs["attempts"]
            .as_object()
            .map_or(true, |attempts| !attempts.contains_key(&ctx.attempt_id().to_string()))
    );
}

#[tokio::test]
async fn conflict_with_concurrent_writer_surfaces_to_the_caller() {
    let cluster = MemoryCluster::new();
    let collection = cluster.collection(&keyspace()).await.unwrap();
    collection
        .insert("doc", json!({"v": 1}), InsertOptions::default())
        .await
        .unwrap();

    let session = session(&cluster);
    let mut ctx = session.new_attempt();
    let doc = ctx.get(&record("doc")).await.unwrap().unwrap();

    // A concurrent writer moves the document between read and staging.
    collection
        .mutate_in(
            "doc",
            &[MutateInSpec::set_doc(json!({"v": "concurrent"}))],
            MutateInOptions::default().with_store_semantics(StoreSemantics::Replace),
        )
        .await
        .unwrap();

    let err = ctx.replace(&doc, json!({"v": 2})).await.unwrap_err();
    assert!(matches!(err, TransactionError::Conflict { .. }));
}

#[tokio::test]
async fn conflict_with_another_attempts_staging_surfaces_before_writing() {
    let cluster = MemoryCluster::new();
    let collection = cluster.collection(&keyspace()).await.unwrap();
    collection
        .insert("doc", json!({"v": 1}), InsertOptions::default())
        .await
        .unwrap();

    let session = session(&cluster);
    let mut first = session.new_attempt();
    let doc = first.get(&record("doc")).await.unwrap().unwrap();
    first.replace(&doc, json!({"v": "first"})).await.unwrap();

    // A second attempt reads the committed body (staging is advisory)...
    let mut second = session.new_attempt();
    let seen = second.get(&record("doc")).await.unwrap().unwrap();
    assert_eq!(seen.content, json!({"v": 1}));

    // ...but must not stage over the first attempt's write.
    let err = second.replace(&seen, json!({"v": "second"})).await.unwrap_err();
    assert!(matches!(err, TransactionError::Conflict { .. }));
}

#[tokio::test]
async fn insert_conflicts_with_another_attempts_staged_insert() {
    let cluster = MemoryCluster::new();
    let session = session(&cluster);

    let mut first = session.new_attempt();
    first.insert(&record("doc"), json!({"v": 1})).await.unwrap();

    let mut second = session.new_attempt();
    let err = second.insert(&record("doc"), json!({"v": 2})).await.unwrap_err();
    assert!(matches!(err, TransactionError::Conflict { .. }));
}

#[tokio::test]
async fn rollback_releases_staged_documents() {
    let cluster = MemoryCluster::new();
    let collection = cluster.collection(&keyspace()).await.unwrap();
    collection
        .insert("doc-rep", json!({"v": "before"}), InsertOptions::default())
        .await
        .unwrap();

    let session = session(&cluster);
    let mut ctx = session.new_attempt();
    ctx.insert(&record("doc-ins"), json!({"v": "staged"})).await.unwrap();
    let rep = ctx.get(&record("doc-rep")).await.unwrap().unwrap();
    ctx.replace(&rep, json!({"v": "staged"})).await.unwrap();
    let atr_id = ctx.cleanup_request().unwrap().atr_id().to_string();

    ctx.rollback().await.unwrap();
    assert_eq!(ctx.state(), AttemptState::RolledBack);
    assert!(ctx.cleanup_request().is_none());

    // Replaced document released to its pre-transaction value.
    assert_eq!(
        collection.get("doc-rep").await.unwrap().content,
        json!({"v": "before"})
    );
    assert_eq!(cluster.xattrs(&keyspace(), "doc-rep"), Some(json!({})));
    // Staged insert never became visible.
    assert!(!collection.exists("doc-ins").await.unwrap());

    // The ATR entry is gone.
    let atr_xattrs = cluster.xattrs(&keyspace(), &atr_id).unwrap();
    assert!(
        atr_xattrs["attempts"]
            .as_object()
            .map_or(true, |attempts| !attempts.contains_key(&ctx.attempt_id().to_string()))
    );
}

#[tokio::test]
async fn rollback_after_commit_is_rejected() {
    let cluster = MemoryCluster::new();
    let session = session(&cluster);
    let mut ctx = session.new_attempt();
    ctx.insert(&record("doc"), json!({"v": 1})).await.unwrap();
    ctx.commit().await.unwrap();

    let err = ctx.rollback().await.unwrap_err();
    assert!(matches!(err, TransactionError::IllegalState { .. }));
}

#[tokio::test]
async fn commit_survives_unstage_failure_and_hands_off_to_cleanup() {
    let cluster = MemoryCluster::new();
    let collection = cluster.collection(&keyspace()).await.unwrap();
    collection
        .insert("doc", json!({"v": 1}), InsertOptions::default())
        .await
        .unwrap();

    let session = session(&cluster);
    let mut ctx = session.new_attempt();
    let doc = ctx.get(&record("doc")).await.unwrap().unwrap();
    ctx.replace(&doc, json!({"v": 2})).await.unwrap();

    // The document is deleted out-of-band after staging: the commit-time
    // unstage CAS write fails.
    collection
        .remove("doc", atoll_kv::RemoveOptions::default())
        .await
        .unwrap();

    ctx.commit().await.unwrap();
    assert_eq!(ctx.state(), AttemptState::Committed);
    assert!(!ctx.unstaging_complete());

    // The attempt hands the rest to cleanup.
    let request = ctx.cleanup_request().expect("committed attempt needs cleanup");
    assert_eq!(request.state(), AttemptState::Committed);

    // Cleanup succeeds: the document's staging is gone (purged with the
    // deletion), so the guard skips it and the ATR entry is removed.
    let outcomes = {
        assert!(session.add_cleanup_request(&ctx));
        session.cleanup_attempts().await
    };
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].success);
}

#[tokio::test]
async fn abandoned_attempt_is_cleaned_through_the_session_queue() {
    let cluster = MemoryCluster::new();
    let session = session(&cluster);
    let mut ctx = session.new_attempt();
    ctx.insert(&record("doc"), json!({"v": 1})).await.unwrap();
    let atr_id = ctx.cleanup_request().unwrap().atr_id().to_string();

    // The attempt is abandoned mid-flight (no commit, no rollback); the
    // session enqueues its cleanup request.
    assert!(session.add_cleanup_request(&ctx));
    assert_eq!(session.cleanup_queue_length(), 1);

    let outcomes = session.cleanup_attempts().await;
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].success, "reason: {:?}", outcomes[0].failure_reason);

    // PENDING cleanup removes the ATR entry but leaves documents alone.
    let atr_xattrs = cluster.xattrs(&keyspace(), &atr_id).unwrap();
    assert!(
        atr_xattrs["attempts"]
            .as_object()
            .map_or(true, |attempts| !attempts.contains_key(&ctx.attempt_id().to_string()))
    );
    let doc_xattrs = cluster.xattrs(&keyspace(), "doc").unwrap();
    assert_eq!(doc_xattrs["txn"]["ver"], json!(ctx.attempt_id().to_string()));
}

#[tokio::test]
async fn insert_after_own_staged_remove_restages_as_replace() {
    let cluster = MemoryCluster::new();
    let collection = cluster.collection(&keyspace()).await.unwrap();
    collection
        .insert("doc", json!({"v": 1}), InsertOptions::default())
        .await
        .unwrap();

    let session = session(&cluster);
    let mut ctx = session.new_attempt();
    let doc = ctx.get(&record("doc")).await.unwrap().unwrap();
    ctx.remove(&doc).await.unwrap();
    assert!(ctx.get(&record("doc")).await.unwrap().is_none());

    ctx.insert(&record("doc"), json!({"v": 2})).await.unwrap();
    let reread = ctx.get(&record("doc")).await.unwrap().unwrap();
    assert_eq!(reread.content, json!({"v": 2}));

    ctx.commit().await.unwrap();
    assert_eq!(collection.get("doc").await.unwrap().content, json!({"v": 2}));
}

#[tokio::test]
async fn remove_of_own_staged_insert_unstages_it() {
    let cluster = MemoryCluster::new();
    let collection = cluster.collection(&keyspace()).await.unwrap();
    let session = session(&cluster);
    let mut ctx = session.new_attempt();

    ctx.insert(&record("doc"), json!({"v": 1})).await.unwrap();
    let staged = ctx.get(&record("doc")).await.unwrap().unwrap();
    ctx.remove(&staged).await.unwrap();

    assert!(ctx.get(&record("doc")).await.unwrap().is_none());
    ctx.commit().await.unwrap();
    assert!(!collection.exists("doc").await.unwrap());
}
