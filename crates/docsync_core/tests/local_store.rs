//! Integration tests for the local store.

use bytes::Bytes;
use docsync_core::{
    field_filter, DocumentKey, DocumentKeySet, FieldMask, FieldPath, LocalStore, LocalStoreConfig,
    LocalViewChanges, MutableDocument, Mutation, MutationBatchResult, MutationResult, ObjectValue, Operator,
    Precondition, Query, QueryEngineConfig, QueryStrategy, RemoteEvent, SnapshotVersion, TargetChange, TargetId,
    TransformOperation, Value,
};
use docsync_storage::{KvStore, MemoryKvStore};
use proptest::prelude::*;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

const KEYS: [&str; 3] = ["rooms/a", "rooms/b", "rooms/c"];
const FIELDS: [&str; 4] = ["v", "p", "n", "tags"];

fn key(path: &str) -> DocumentKey {
    DocumentKey::parse(path).unwrap()
}

fn field(path: &str) -> FieldPath {
    FieldPath::parse(path).unwrap()
}

#[derive(Debug, Clone)]
enum Op {
    Set(usize, i64),
    Patch(usize, i64),
    Delete(usize),
    Increment(usize, i64),
    Union(usize, i64),
}

impl Op {
    fn to_mutation(&self) -> Mutation {
        match self {
            Op::Set(k, v) => Mutation::set(key(KEYS[*k]), ObjectValue::from_pairs([("v", Value::Integer(*v))])),
            Op::Patch(k, p) => {
                let mut mask = FieldMask::empty();
                mask.insert(field("p"));
                Mutation::patch(key(KEYS[*k]), ObjectValue::from_pairs([("p", Value::Integer(*p))]), mask)
                    .with_precondition(Precondition::Exists(true))
            }
            Op::Delete(k) => Mutation::delete(key(KEYS[*k])),
            Op::Increment(k, by) => transform(*k, "n", TransformOperation::NumericIncrement(Value::Integer(*by))),
            Op::Union(k, element) => {
                transform(*k, "tags", TransformOperation::ArrayUnion(vec![Value::Integer(*element)]))
            }
        }
    }
}

fn transform(k: usize, name: &str, operation: TransformOperation) -> Mutation {
    Mutation::patch(key(KEYS[k]), ObjectValue::empty(), FieldMask::empty())
        .with_precondition(Precondition::Exists(true))
        .with_transform(field(name), operation)
}

type Fields = BTreeMap<&'static str, Value>;
type Docs = BTreeMap<usize, Option<Fields>>;

fn apply(docs: &mut Docs, op: &Op) {
    match op {
        Op::Set(k, v) => {
            docs.insert(*k, Some([("v", Value::Integer(*v))].into_iter().collect()));
        }
        Op::Patch(k, p) => {
            if let Some(Some(fields)) = docs.get_mut(k) {
                fields.insert("p", Value::Integer(*p));
            }
        }
        Op::Delete(k) => {
            docs.insert(*k, None);
        }
        Op::Increment(k, by) => {
            if let Some(Some(fields)) = docs.get_mut(k) {
                let base = match fields.get("n") {
                    Some(Value::Integer(n)) => *n,
                    _ => 0,
                };
                fields.insert("n", Value::Integer(base + by));
            }
        }
        Op::Union(k, element) => {
            if let Some(Some(fields)) = docs.get_mut(k) {
                let mut tags = match fields.get("tags") {
                    Some(Value::Array(tags)) => tags.clone(),
                    _ => Vec::new(),
                };
                let element = Value::Integer(*element);
                if !tags.contains(&element) {
                    tags.push(element);
                }
                fields.insert("tags", Value::Array(tags));
            }
        }
    }
}

/// Remote documents plus the batches the backend has not confirmed yet.
#[derive(Debug, Default)]
struct Model {
    remote: Docs,
    pending: VecDeque<Vec<Op>>,
}

impl Model {
    fn local_view(&self) -> Docs {
        let mut docs = self.remote.clone();
        for op in self.pending.iter().flatten() {
            apply(&mut docs, op);
        }
        docs
    }

    /// Commits the oldest batch on the remote side and returns the values
    /// the backend resolved for each mutation's transforms.
    fn commit_head(&mut self) -> Vec<Vec<Value>> {
        let batch = self.pending.pop_front().unwrap_or_default();
        batch
            .iter()
            .map(|op| {
                apply(&mut self.remote, op);
                let (k, name) = match op {
                    Op::Increment(k, _) => (k, "n"),
                    Op::Union(k, _) => (k, "tags"),
                    _ => return Vec::new(),
                };
                self.remote
                    .get(k)
                    .cloned()
                    .flatten()
                    .and_then(|fields| fields.get(name).cloned())
                    .into_iter()
                    .collect()
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
enum Step {
    Write(Vec<Op>),
    Remote(usize, Option<Fields>),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..KEYS.len(), -50i64..50).prop_map(|(k, v)| Op::Set(k, v)),
        (0..KEYS.len(), -50i64..50).prop_map(|(k, v)| Op::Patch(k, v)),
        (0..KEYS.len()).prop_map(Op::Delete),
        (0..KEYS.len(), -5i64..5).prop_map(|(k, by)| Op::Increment(k, by)),
        (0..KEYS.len(), 0i64..4).prop_map(|(k, element)| Op::Union(k, element)),
    ]
}

fn remote_strategy() -> impl Strategy<Value = Option<Fields>> {
    prop::option::of(
        (
            -50i64..50,
            prop::option::of(-50i64..50),
            prop::option::of(prop::collection::vec(0i64..4, 0..3)),
        )
            .prop_map(|(v, n, tags)| {
                let mut fields = Fields::new();
                fields.insert("v", Value::Integer(v));
                if let Some(n) = n {
                    fields.insert("n", Value::Integer(n));
                }
                if let Some(tags) = tags {
                    fields.insert("tags", Value::Array(tags.into_iter().map(Value::Integer).collect()));
                }
                fields
            }),
    )
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => prop::collection::vec(op_strategy(), 1..4).prop_map(Step::Write),
        1 => (0..KEYS.len(), remote_strategy()).prop_map(|(k, fields)| Step::Remote(k, fields)),
    ]
}

fn assert_matches_model(store: &LocalStore, docs: &Docs) -> Result<(), TestCaseError> {
    for (index, path) in KEYS.iter().enumerate() {
        let doc = store.read_document(&key(path));
        match docs.get(&index).cloned().flatten() {
            Some(fields) => {
                prop_assert!(doc.is_found_document(), "{path} should exist: {doc:?}");
                for name in FIELDS {
                    prop_assert_eq!(doc.field(&field(name)).cloned(), fields.get(name).cloned(), "{}.{}", path, name);
                }
            }
            None => prop_assert!(!doc.is_found_document(), "{path} should not exist: {doc:?}"),
        }
    }
    Ok(())
}

fn pin_all_keys(store: &mut LocalStore) -> TargetId {
    let target = store
        .allocate_target(Query::collection("rooms").unwrap().to_target())
        .unwrap();
    store
        .notify_local_view_changes(&[LocalViewChanges {
            target_id: target.target_id,
            from_cache: true,
            added_keys: KEYS.iter().map(|p| key(p)).collect(),
            removed_keys: DocumentKeySet::new(),
        }])
        .unwrap();
    target.target_id
}

fn remote_update(target_id: TargetId, k: usize, fields: Option<&Fields>, micros: i64) -> RemoteEvent {
    let version = SnapshotVersion::from_micros(micros);
    let doc_key = key(KEYS[k]);
    let mut change = TargetChange::current_with_token(Bytes::from(format!("t{micros}")));
    let doc = match fields {
        Some(fields) => {
            change.added_documents = [doc_key.clone()].into_iter().collect();
            let data = ObjectValue::from_pairs(fields.iter().map(|(name, value)| (*name, value.clone())));
            MutableDocument::new_found(doc_key.clone(), version, data)
        }
        None => MutableDocument::new_no_document(doc_key.clone(), version),
    };
    RemoteEvent {
        snapshot_version: version,
        target_changes: [(target_id, change)].into_iter().collect(),
        document_updates: [(doc_key, doc)].into_iter().collect(),
        ..RemoteEvent::default()
    }
}

fn acknowledge_head(
    store: &mut LocalStore,
    commit_micros: i64,
    transform_results: Vec<Vec<Value>>,
) -> docsync_core::CoreResult<()> {
    let batch = store.next_mutation_batch(-1).unwrap();
    let version = SnapshotVersion::from_micros(commit_micros);
    let mut transform_results = transform_results.into_iter();
    let results = batch
        .mutations
        .iter()
        .map(|_| MutationResult::new(version).with_transform_results(transform_results.next().unwrap_or_default()))
        .collect();
    let result = MutationBatchResult::new(batch, version, results, Bytes::from_static(b"token"))?;
    store.acknowledge_batch(&result).map(|_| ())
}

proptest! {
    #[test]
    fn local_view_equals_batches_applied_in_order(
        steps in prop::collection::vec(step_strategy(), 1..12)
    ) {
        let mut store = LocalStore::memory_only(LocalStoreConfig::default());
        let target_id = pin_all_keys(&mut store);
        let mut model = Model::default();
        let mut micros = 0;

        for step in &steps {
            match step {
                Step::Write(batch) => {
                    store
                        .write_locally(batch.iter().map(Op::to_mutation).collect())
                        .unwrap();
                    model.pending.push_back(batch.clone());
                }
                Step::Remote(k, fields) => {
                    // Pending transforms are re-resolved on top of the new
                    // remote value.
                    micros += 10;
                    store
                        .apply_remote_event(&remote_update(target_id, *k, fields.as_ref(), micros))
                        .unwrap();
                    model.remote.insert(*k, fields.clone());
                }
            }
            assert_matches_model(&store, &model.local_view())?;
        }

        // Acknowledging moves every batch into the remote cache without
        // changing what the user sees.
        while !model.pending.is_empty() {
            micros += 10;
            let transform_results = model.commit_head();
            acknowledge_head(&mut store, micros, transform_results).unwrap();
            assert_matches_model(&store, &model.local_view())?;
        }
        prop_assert_eq!(store.pending_batch_count(), 0);
    }

    #[test]
    fn acknowledgements_must_follow_queue_order(count in 2usize..6, skip in 1usize..5) {
        let skip = skip.min(count - 1);
        let mut store = LocalStore::memory_only(LocalStoreConfig::default());
        let mut ids = Vec::new();
        for i in 0..count {
            let result = store
                .write_locally(vec![Op::Set(i % KEYS.len(), i as i64).to_mutation()])
                .unwrap();
            ids.push(result.batch_id);
        }
        prop_assert!(ids.windows(2).all(|w| w[0] < w[1]));

        let out_of_order = store.next_mutation_batch(ids[skip] - 1).unwrap();
        let version = SnapshotVersion::from_micros(10);
        let results = out_of_order.mutations.iter().map(|_| MutationResult::new(version)).collect();
        let result = MutationBatchResult::new(out_of_order, version, results, Bytes::new()).unwrap();
        let err = store.acknowledge_batch(&result).unwrap_err();
        prop_assert!(err.is_fatal());
        prop_assert_eq!(store.pending_batch_count(), count);

        for i in 0..count {
            acknowledge_head(&mut store, (i as i64 + 1) * 10, Vec::new()).unwrap();
        }
        prop_assert_eq!(store.pending_batch_count(), 0);
    }
}

#[test]
fn pending_writes_survive_restart() {
    let kv = Arc::new(MemoryKvStore::new());
    let mut store = LocalStore::open(kv.clone(), LocalStoreConfig::default()).unwrap();
    let written = store.write_locally(vec![Op::Set(0, 7).to_mutation()]).unwrap();
    store.set_last_stream_token(Bytes::from_static(b"resume")).unwrap();

    let reopened = LocalStore::open(kv, LocalStoreConfig::default()).unwrap();
    assert_eq!(reopened.pending_batch_count(), 1);
    assert_eq!(reopened.get_highest_unacknowledged_batch_id(), written.batch_id);
    assert_eq!(reopened.get_last_stream_token(), Bytes::from_static(b"resume"));
    let doc = reopened.read_document(&key("rooms/a"));
    assert_eq!(doc.field(&field("v")), Some(&Value::Integer(7)));
    assert!(doc.has_local_mutations());
}

#[test]
fn lost_storage_continues_in_memory() {
    let kv = Arc::new(MemoryKvStore::new());
    let mut store = LocalStore::open(kv.clone(), LocalStoreConfig::default()).unwrap();
    assert!(!store.is_memory_only());

    kv.set_available(false);
    let written = store.write_locally(vec![Op::Set(1, 3).to_mutation()]).unwrap();
    assert!(store.is_memory_only());
    assert_eq!(store.pending_batch_count(), 1);
    assert_eq!(store.get_highest_unacknowledged_batch_id(), written.batch_id);

    kv.set_available(true);
    let commits = kv.commit_count();
    store.write_locally(vec![Op::Set(2, 4).to_mutation()]).unwrap();
    assert_eq!(kv.commit_count(), commits);
}

#[test]
fn failed_commit_leaves_store_unchanged() {
    let kv = Arc::new(MemoryKvStore::new());
    let mut store = LocalStore::open(kv.clone(), LocalStoreConfig::default()).unwrap();
    kv.fail_next_commit();
    assert!(store.write_locally(vec![Op::Set(0, 1).to_mutation()]).is_err());
    assert_eq!(store.pending_batch_count(), 0);
    assert!(!store.read_document(&key("rooms/a")).is_found_document());
    assert!(!store.is_memory_only());
}

#[test]
fn empty_store_reports_nothing_pending() {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let store = LocalStore::open(kv, LocalStoreConfig::default()).unwrap();
    assert_eq!(store.pending_batch_count(), 0);
    assert!(store.next_mutation_batch(-1).is_none());
    assert!(store.get_last_stream_token().is_empty());
}

#[test]
fn costly_scans_create_indexes_until_disabled() {
    let config = LocalStoreConfig::default().with_query_engine(
        QueryEngineConfig::new()
            .with_index_auto_creation(true)
            .with_min_collection_size(10),
    );
    let mut store = LocalStore::memory_only(config);
    let target = store
        .allocate_target(Query::collection("items").unwrap().to_target())
        .unwrap();

    let docs: Vec<_> = (0..30)
        .map(|i| {
            docsync_core::MutableDocument::new_found(
                key(&format!("items/{i:02}")),
                SnapshotVersion::from_micros(5),
                ObjectValue::from_pairs([("kind", Value::from(if i == 0 { "rare" } else { "common" }))]),
            )
        })
        .collect();
    let mut change = docsync_core::TargetChange::current_with_token(Bytes::from_static(b"t"));
    change.added_documents = docs.iter().map(|d| d.key().clone()).collect();
    let event = docsync_core::RemoteEvent {
        snapshot_version: SnapshotVersion::from_micros(5),
        target_changes: [(target.target_id, change)].into_iter().collect(),
        document_updates: docs.iter().map(|d| (d.key().clone(), d.clone())).collect(),
        ..Default::default()
    };
    store.apply_remote_event(&event).unwrap();

    let rare = Query::collection("items")
        .unwrap()
        .with_filter(field_filter("kind", Operator::Equal, "rare").unwrap());
    let first = store.execute_query(&rare, false).unwrap();
    assert_eq!(first.strategy, QueryStrategy::FullScan);
    assert_eq!(first.documents.len(), 1);
    assert_eq!(store.field_indexes().len(), 1);

    let second = store.execute_query(&rare, false).unwrap();
    assert_eq!(second.strategy, QueryStrategy::Index);
    assert_eq!(second.documents.len(), 1);

    store.delete_all_field_indexes().unwrap();
    store.set_index_auto_creation_enabled(false);
    let third = store.execute_query(&rare, false).unwrap();
    assert_eq!(third.strategy, QueryStrategy::FullScan);
    assert!(store.field_indexes().is_empty());
}
