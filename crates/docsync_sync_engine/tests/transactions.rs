//! Integration tests for optimistic transactions.

use docsync_codec::Value;
use docsync_core::{MutationKind, Precondition};
use docsync_sync_engine::{DocumentData, SetOptions, SyncError};
use docsync_sync_protocol::{Code, Status};
use docsync_testkit::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[tokio::test]
async fn contention_retries_the_whole_transaction() {
    init_tracing();
    let (connection, _backend) = mock_backend();
    connection.set_document(doc("counters/visits", 5, &[("n", Value::Integer(1))]));
    connection.push_commit_response(Err(Status::new(Code::Aborted, "contention")));
    let store = open_store(Arc::clone(&connection));

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let seen = store
        .run_transaction(move |tx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let snapshot = tx.get("counters/visits").await?;
                let n = match snapshot.get("n") {
                    Some(Value::Integer(n)) => *n,
                    _ => 0,
                };
                tx.set(
                    "counters/visits",
                    DocumentData::new().with("n", n + 1),
                    SetOptions::Overwrite,
                )?;
                Ok::<_, SyncError>(n)
            }
        })
        .await
        .unwrap();

    assert_eq!(seen, 1);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    let commits = connection.commits();
    assert_eq!(commits.len(), 2);
    for commit in &commits {
        assert_eq!(commit.len(), 1);
        assert_eq!(commit[0].precondition(), &Precondition::UpdateTime(version(5)));
    }
}

#[tokio::test]
async fn permanent_errors_are_not_retried() {
    let (connection, _backend) = mock_backend();
    connection.push_commit_response(Err(Status::new(Code::PermissionDenied, "read only")));
    let store = open_store(Arc::clone(&connection));

    let err = store
        .run_transaction(|tx| async move {
            tx.set("rooms/a", DocumentData::new().with("n", 1i64), SetOptions::Overwrite)?;
            Ok::<_, SyncError>(())
        })
        .await
        .unwrap_err();

    assert_eq!(err.code(), Some(Code::PermissionDenied));
    assert_eq!(connection.commits().len(), 1);
}

#[tokio::test]
async fn reads_after_writes_are_rejected() {
    let (connection, _backend) = mock_backend();
    let store = open_store(Arc::clone(&connection));

    let err = store
        .run_transaction(|tx| async move {
            tx.delete("rooms/a")?;
            tx.get("rooms/a").await?;
            Ok::<_, SyncError>(())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Validation(_)));
    assert!(connection.commits().is_empty());
}

#[tokio::test]
async fn unwritten_reads_are_verified_at_commit() {
    let (connection, _backend) = mock_backend();
    connection.set_document(doc("rooms/a", 4, &[("owner", Value::from("ada"))]));
    let store = open_store(Arc::clone(&connection));

    store
        .run_transaction(|tx| async move {
            let owner = tx.get("rooms/a").await?;
            assert!(owner.exists());
            let missing = tx.get("rooms/b").await?;
            assert!(!missing.exists());
            tx.set("rooms/b", DocumentData::new().with("owner", "ada"), SetOptions::Overwrite)?;
            Ok::<_, SyncError>(())
        })
        .await
        .unwrap();

    let commits = connection.commits();
    assert_eq!(commits.len(), 1);
    let mutations = &commits[0];
    assert_eq!(mutations.len(), 2);
    // Writes come first, then a verify for each document only read.
    assert_eq!(mutations[0].key(), &key("rooms/b"));
    assert_eq!(mutations[0].precondition(), &Precondition::Exists(false));
    assert_eq!(mutations[1].key(), &key("rooms/a"));
    assert!(matches!(mutations[1].kind(), MutationKind::Verify));
    assert_eq!(mutations[1].precondition(), &Precondition::UpdateTime(version(4)));
}
