//! Integration tests for the write path: latency compensation, the write
//! stream handshake, retransmission and rejection.

use docsync_codec::Value;
use docsync_core::{MutationKind, Precondition};
use docsync_sync_engine::{DocumentData, ListenOptions, SetOptions, Source, StreamConfig, SyncError, SyncResult};
use docsync_sync_protocol::{Code, ListenRequest, Status, WatchTargetChangeState, WriteRequest};
use docsync_testkit::prelude::*;
use std::time::Duration;
use tokio::task::JoinHandle;

fn spawn_set(store: &docsync_sync_engine::DocumentStore, path: &'static str, name: &'static str) -> JoinHandle<SyncResult<()>> {
    let store = store.clone();
    tokio::spawn(async move {
        store
            .set(path, DocumentData::new().with("name", name), SetOptions::Overwrite)
            .await
    })
}

async fn handshake(write: &mut MockStream) {
    assert_eq!(write.next_write_request().await, WriteRequest::Handshake);
    write.ack_handshake(b"handshake");
}

#[tokio::test]
async fn set_completes_when_the_backend_acknowledges() {
    init_tracing();
    let (connection, mut backend) = mock_backend();
    let store = open_store(connection);

    let pending = spawn_set(&store, "rooms/eros", "Eros");
    let mut write = backend.next_write_stream().await;
    handshake(&mut write).await;

    let mutations = write.next_mutations().await;
    assert_eq!(mutations.len(), 1);
    assert_eq!(mutations[0].key(), &key("rooms/eros"));
    assert!(!pending.is_finished());

    write.ack_write(5, 1);
    pending.await.unwrap().unwrap();
    store.wait_for_pending_writes().await.unwrap();
}

#[tokio::test]
async fn pending_writes_are_visible_in_the_cache() {
    let (connection, _backend) = mock_backend();
    let store = open_store(connection);

    let _pending = spawn_set(&store, "rooms/eros", "Eros");
    settle(&store).await;

    let snapshot = store.get_document("rooms/eros", Source::Cache).await.unwrap();
    assert!(snapshot.exists());
    assert!(snapshot.metadata().has_pending_writes);
    assert!(snapshot.metadata().from_cache);
    assert_eq!(snapshot.get("name"), Some(&Value::from("Eros")));

    let missing = store.get_document("rooms/other", Source::Cache).await;
    assert!(matches!(missing, Err(SyncError::Unavailable(_))));
}

#[tokio::test]
async fn unacknowledged_batches_are_resent_on_a_new_stream() {
    let (connection, mut backend) = mock_backend();
    let store = open_store(connection);

    let pending = spawn_set(&store, "rooms/eros", "Eros");
    let mut first = backend.next_write_stream().await;
    handshake(&mut first).await;
    let sent = first.next_mutations().await;
    first.close(Some(Status::new(Code::Unavailable, "connection reset")));

    let mut second = backend.next_write_stream().await;
    handshake(&mut second).await;
    assert_eq!(second.next_mutations().await, sent);
    second.ack_write(7, 1);
    pending.await.unwrap().unwrap();
}

#[tokio::test]
async fn unanswered_writes_are_resent_after_the_watchdog_expires() {
    let (connection, mut backend) = mock_backend();
    let config = fast_config().with_stream(StreamConfig::new().with_health_check_timeout(Duration::from_millis(300)));
    let store = open_store_with_config(connection, config);

    let pending = spawn_set(&store, "rooms/eros", "Eros");
    let mut first = backend.next_write_stream().await;
    handshake(&mut first).await;
    let sent = first.next_mutations().await;
    // No acknowledgement ever arrives on the first stream.
    first.wait_for_close().await;

    let mut second = backend.next_write_stream().await;
    handshake(&mut second).await;
    assert_eq!(second.next_mutations().await, sent);
    second.ack_write(7, 1);
    pending.await.unwrap().unwrap();
}

#[tokio::test]
async fn offline_write_is_confirmed_after_reconnecting() {
    let (connection, mut backend) = mock_backend();
    let store = open_store(connection);
    store.disable_network().await.unwrap();

    let pending = spawn_set(&store, "rooms/eros", "Eros");
    settle(&store).await;
    let mut snapshots = store.snapshots(query("rooms"), ListenOptions::default());

    let optimistic = next_snapshot(&mut snapshots).await;
    assert_eq!(doc_paths(&optimistic), vec!["rooms/eros"]);
    assert!(optimistic.from_cache);
    assert!(optimistic.has_pending_writes());
    let optimistic_data = optimistic.documents().next().and_then(|d| d.data().cloned());
    assert!(optimistic_data.is_some());

    store.enable_network().await.unwrap();
    let mut write = backend.next_write_stream().await;
    handshake(&mut write).await;
    write.next_mutations().await;
    write.ack_write(5, 1);
    pending.await.unwrap().unwrap();

    let mut listen = backend.next_listen_stream().await;
    let ListenRequest::AddTarget(request) = listen.next_listen_request().await else {
        panic!("expected AddTarget");
    };
    let target_id = request.target_id;
    listen.send_watch(target_change(WatchTargetChangeState::Added, &[target_id]));
    listen.send_watch(doc_update(doc("rooms/eros", 5, &[("name", Value::from("Eros"))]), &[target_id]));
    listen.send_watch(current(&[target_id], "t1"));
    listen.send_watch(global_snapshot(5, "t1"));

    // Acknowledgement may raise a cached event first; wait for the synced one.
    let mut confirmed = next_snapshot(&mut snapshots).await;
    for _ in 0..3 {
        if !confirmed.from_cache {
            break;
        }
        confirmed = next_snapshot(&mut snapshots).await;
    }
    assert!(!confirmed.from_cache);
    assert!(!confirmed.has_pending_writes());
    assert_eq!(doc_paths(&confirmed), vec!["rooms/eros"]);
    let confirmed_data = confirmed.documents().next().and_then(|d| d.data().cloned());
    assert_eq!(confirmed_data, optimistic_data);
}

#[tokio::test]
async fn rejected_write_is_rolled_back() {
    let (connection, mut backend) = mock_backend();
    let store = open_store(connection);
    let mut snapshots = store.snapshots(query("rooms"), ListenOptions::default());

    let pending = spawn_set(&store, "rooms/eros", "Eros");
    let optimistic = next_snapshot(&mut snapshots).await;
    assert_eq!(doc_paths(&optimistic), vec!["rooms/eros"]);
    assert!(optimistic.has_pending_writes());

    let mut write = backend.next_write_stream().await;
    handshake(&mut write).await;
    write.next_mutations().await;
    write.close(Some(Status::new(Code::PermissionDenied, "read only")));

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.code(), Some(Code::PermissionDenied));
    assert!(err.is_permanent());

    let reverted = next_snapshot(&mut snapshots).await;
    assert!(reverted.is_empty());
}

#[tokio::test]
async fn writes_queue_while_the_network_is_disabled() {
    let (connection, mut backend) = mock_backend();
    let store = open_store(connection);
    store.disable_network().await.unwrap();

    let pending = spawn_set(&store, "rooms/eros", "Eros");
    settle(&store).await;
    assert!(backend.try_next_write_stream().is_none());

    let waiter = {
        let store = store.clone();
        tokio::spawn(async move { store.wait_for_pending_writes().await })
    };

    store.enable_network().await.unwrap();
    let mut write = backend.next_write_stream().await;
    handshake(&mut write).await;
    write.next_mutations().await;
    write.ack_write(3, 1);

    pending.await.unwrap().unwrap();
    waiter.await.unwrap().unwrap();
}

#[tokio::test]
async fn batches_commit_atomically() {
    let (connection, mut backend) = mock_backend();
    let store = open_store(connection);

    let mut batch = store.batch();
    batch
        .set("rooms/a", DocumentData::new().with("n", 1i64), SetOptions::Overwrite)
        .unwrap()
        .update("rooms/b", DocumentData::new().with("n", 2i64))
        .unwrap()
        .delete("rooms/c")
        .unwrap();
    assert_eq!(batch.len(), 3);
    let pending = tokio::spawn(batch.commit());

    let mut write = backend.next_write_stream().await;
    handshake(&mut write).await;
    let mutations = write.next_mutations().await;
    assert_eq!(mutations.len(), 3);
    assert!(matches!(mutations[0].kind(), MutationKind::Set { .. }));
    assert_eq!(mutations[1].precondition(), &Precondition::Exists(true));
    assert!(matches!(mutations[2].kind(), MutationKind::Delete));

    write.ack_write(9, 3);
    pending.await.unwrap().unwrap();
}

#[tokio::test]
async fn add_generates_a_document_id() {
    let (connection, mut backend) = mock_backend();
    let store = open_store(connection);

    let pending = {
        let store = store.clone();
        tokio::spawn(async move { store.add("rooms", DocumentData::new().with("name", "new")).await })
    };
    let mut write = backend.next_write_stream().await;
    handshake(&mut write).await;
    let mutations = write.next_mutations().await;
    write.ack_write(2, 1);

    let key = pending.await.unwrap().unwrap();
    assert_eq!(key.document_id().len(), 20);
    assert_eq!(mutations[0].key(), &key);
}

#[tokio::test]
async fn terminate_fails_outstanding_work() {
    let (connection, mut backend) = mock_backend();
    let store = open_store(connection);
    let mut snapshots = store.snapshots(query("rooms"), ListenOptions::default());

    let pending = spawn_set(&store, "rooms/eros", "Eros");
    let _write = backend.next_write_stream().await;
    next_snapshot(&mut snapshots).await;

    store.terminate().await.unwrap();
    assert!(store.is_terminated());
    assert!(matches!(pending.await.unwrap(), Err(SyncError::Terminated)));

    let event = futures::StreamExt::next(&mut snapshots).await.unwrap();
    assert!(matches!(event, Err(SyncError::Terminated)));

    let late = store
        .set("rooms/late", DocumentData::new().with("n", 1i64), SetOptions::Overwrite)
        .await;
    assert!(matches!(late, Err(SyncError::Terminated)));
}
