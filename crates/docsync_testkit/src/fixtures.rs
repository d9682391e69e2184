//! Test fixtures and store helpers.
//!
//! Short constructors for the values tests build over and over, plus a
//! store opener with timers short enough for real-time tests.

use bytes::Bytes;
use docsync_codec::{MapValue, Value};
use docsync_core::{DocumentKey, MutableDocument, ObjectValue, Query, SnapshotVersion, TargetId};
use docsync_sync_engine::{
    BackoffConfig, DocumentStore, EngineConfig, OnlineStateConfig, SnapshotStream, StreamConfig, ViewSnapshot,
};
use docsync_sync_protocol::{DocumentChange, WatchChange, WatchTargetChange, WatchTargetChangeState};
use docsync_storage::MemoryKvStore;
use futures::{FutureExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;

use crate::mock::{MockConnection, MOCK_TIMEOUT};

/// Parses a document key.
pub fn key(path: &str) -> DocumentKey {
    DocumentKey::parse(path).expect("Invalid document key")
}

/// A collection query.
pub fn query(path: &str) -> Query {
    Query::collection(path).expect("Invalid collection path")
}

/// A version from microseconds.
pub fn version(micros: i64) -> SnapshotVersion {
    SnapshotVersion::from_micros(micros)
}

/// A found document with top-level `fields`.
pub fn doc(path: &str, micros: i64, fields: &[(&str, Value)]) -> MutableDocument {
    let data = ObjectValue::from_pairs(fields.iter().map(|(k, v)| (*k, v.clone())));
    MutableDocument::new_found(key(path), version(micros), data)
}

/// A found document whose data is a JSON object.
///
/// # Panics
///
/// Panics if `json` is not an object.
pub fn json_doc(path: &str, micros: i64, json: serde_json::Value) -> MutableDocument {
    let Value::Map(fields) = value_from_json(json) else {
        panic!("document data must be a JSON object");
    };
    MutableDocument::new_found(key(path), version(micros), ObjectValue::from_map(fields))
}

/// A deleted document.
pub fn deleted(path: &str, micros: i64) -> MutableDocument {
    MutableDocument::new_no_document(key(path), version(micros))
}

/// Converts JSON into a document value. Integral numbers become integers.
pub fn value_from_json(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Boolean(b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => Value::Double(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => Value::String(s),
        serde_json::Value::Array(items) => Value::Array(items.into_iter().map(value_from_json).collect()),
        serde_json::Value::Object(fields) => Value::Map(
            fields
                .into_iter()
                .map(|(k, v)| (k, value_from_json(v)))
                .collect::<MapValue>(),
        ),
    }
}

/// A resume token.
pub fn resume_token(value: &str) -> Bytes {
    Bytes::from(value.to_string())
}

// === Watch changes ===

/// `doc` now matches `targets`.
pub fn doc_update(doc: MutableDocument, targets: &[TargetId]) -> WatchChange {
    WatchChange::Document(DocumentChange::updated(doc, targets.to_vec()))
}

/// The document at `path` stopped matching `targets`.
pub fn doc_removed(path: &str, targets: &[TargetId]) -> WatchChange {
    WatchChange::Document(DocumentChange::removed(key(path), targets.to_vec()))
}

/// A target state change.
pub fn target_change(state: WatchTargetChangeState, targets: &[TargetId]) -> WatchChange {
    WatchChange::Target(WatchTargetChange::new(state, targets.to_vec()))
}

/// `targets` are current, with a resume token.
pub fn current(targets: &[TargetId], token: &str) -> WatchChange {
    WatchChange::Target(
        WatchTargetChange::new(WatchTargetChangeState::Current, targets.to_vec()).with_resume_token(resume_token(token)),
    )
}

/// A global snapshot at `micros`.
pub fn global_snapshot(micros: i64, token: &str) -> WatchChange {
    WatchChange::Target(WatchTargetChange::snapshot(version(micros), resume_token(token)))
}

// === Stores ===

/// Engine configuration with timers short enough for real-time tests.
pub fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .with_persistence(false)
        .with_backoff(
            BackoffConfig::no_jitter()
                .with_initial_delay(Duration::from_millis(10))
                .with_max_delay(Duration::from_millis(50)),
        )
        .with_stream(StreamConfig::new().with_health_check_timeout(Duration::from_secs(2)))
        .with_online_state(OnlineStateConfig::new().with_online_grace_period(Duration::from_millis(200)))
}

/// Opens a memory-only store on `connection` with [`fast_config`].
pub fn open_store(connection: Arc<MockConnection>) -> DocumentStore {
    DocumentStore::open_with_config(
        connection,
        Arc::new(docsync_sync_engine::EmptyCredentialsProvider),
        fast_config(),
    )
    .expect("Failed to open document store")
}

/// Opens a memory-only store on `connection` with a custom `config`.
pub fn open_store_with_config(connection: Arc<MockConnection>, config: EngineConfig) -> DocumentStore {
    DocumentStore::open_with_config(
        connection,
        Arc::new(docsync_sync_engine::EmptyCredentialsProvider),
        config,
    )
    .expect("Failed to open document store")
}

/// Opens a store persisting to `kv` with [`fast_config`]. Reopening on
/// the same `kv` simulates an application restart.
pub fn open_persistent_store(connection: Arc<MockConnection>, kv: Arc<MemoryKvStore>) -> DocumentStore {
    DocumentStore::open_with_backends(
        connection,
        Arc::new(docsync_sync_engine::EmptyCredentialsProvider),
        kv,
        fast_config().with_persistence(true),
    )
    .expect("Failed to open persistent document store")
}

/// Lets queued engine work and spawned stream tasks run to completion.
pub async fn settle(store: &DocumentStore) {
    for _ in 0..10 {
        tokio::task::yield_now().await;
        store.queue().drain().await;
    }
}

/// Waits for the next snapshot of a listener.
///
/// # Panics
///
/// Panics on a listener error, a closed stream, or no snapshot within
/// [`MOCK_TIMEOUT`].
pub async fn next_snapshot(stream: &mut SnapshotStream) -> ViewSnapshot {
    tokio::time::timeout(MOCK_TIMEOUT, stream.next())
        .await
        .expect("No snapshot raised in time")
        .expect("Snapshot stream ended")
        .expect("Listener failed")
}

/// Asserts that a listener has no snapshot waiting.
///
/// # Panics
///
/// Panics if a snapshot or error is ready.
pub fn assert_no_snapshot(stream: &mut SnapshotStream) {
    if let Some(event) = stream.next().now_or_never() {
        panic!("unexpected listener event: {event:?}");
    }
}

/// Returns the keys of a snapshot's documents as paths, in query order.
pub fn doc_paths(snapshot: &ViewSnapshot) -> Vec<String> {
    snapshot.documents().map(|d| d.key().to_string()).collect()
}

/// Installs a test log subscriber honouring `RUST_LOG`. Safe to call from
/// every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_documents_keep_integer_fields() {
        let d = json_doc("rooms/a", 3, serde_json::json!({"n": 2, "x": 1.5, "tags": ["a"]}));
        let data = d.data().unwrap();
        assert_eq!(data.as_map().get("n"), Some(&Value::Integer(2)));
        assert_eq!(data.as_map().get("x"), Some(&Value::Double(1.5)));
        assert_eq!(
            data.as_map().get("tags"),
            Some(&Value::Array(vec![Value::String("a".into())]))
        );
    }
}
