//! Property-based test generators using proptest.
//!
//! Keys and paths are drawn from small alphabets so that generated
//! documents collide often enough to exercise updates and deletes.

use docsync_codec::Value;
use docsync_core::{DocumentKey, FieldMask, FieldPath, MutableDocument, Mutation, ObjectValue, SnapshotVersion};
use proptest::prelude::*;

/// Strategy for collection or document ids.
pub fn segment_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9]{0,5}").expect("Invalid regex")
}

/// Strategy for keys of documents in `collection`.
pub fn document_key_strategy(collection: &'static str) -> impl Strategy<Value = DocumentKey> {
    segment_strategy().prop_map(move |id| {
        DocumentKey::parse(&format!("{collection}/{id}")).expect("Invalid generated key")
    })
}

/// Strategy for top-level field names.
pub fn field_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-e]").expect("Invalid regex")
}

/// Strategy for scalar values.
pub fn scalar_value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Boolean),
        (-1000i64..1000).prop_map(Value::Integer),
        (-1000.0f64..1000.0).prop_map(Value::Double),
        "[a-z]{0,8}".prop_map(Value::String),
    ]
}

/// Strategy for values nested up to three levels.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    scalar_value_strategy().prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map(field_name_strategy(), inner, 0..4).prop_map(Value::Map),
        ]
    })
}

/// Strategy for document data.
pub fn object_value_strategy() -> impl Strategy<Value = ObjectValue> {
    prop::collection::btree_map(field_name_strategy(), value_strategy(), 0..5).prop_map(ObjectValue::from_map)
}

/// Strategy for found documents in `collection` at versions 1 to 100.
pub fn document_strategy(collection: &'static str) -> impl Strategy<Value = MutableDocument> {
    (document_key_strategy(collection), 1i64..100, object_value_strategy()).prop_map(|(key, version, data)| {
        MutableDocument::new_found(key, SnapshotVersion::from_micros(version), data)
    })
}

/// Strategy for set, patch and delete mutations in `collection`.
pub fn mutation_strategy(collection: &'static str) -> impl Strategy<Value = Mutation> {
    prop_oneof![
        (document_key_strategy(collection), object_value_strategy())
            .prop_map(|(key, value)| Mutation::set(key, value)),
        (document_key_strategy(collection), field_name_strategy(), value_strategy()).prop_map(
            |(key, field, value)| {
                let path = FieldPath::parse(&field).expect("Invalid generated field");
                let mut data = ObjectValue::empty();
                data.set(&path, value);
                let mut mask = FieldMask::empty();
                mask.insert(path);
                Mutation::patch(key, data, mask)
            }
        ),
        document_key_strategy(collection).prop_map(Mutation::delete),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn generated_keys_live_in_their_collection(key in document_key_strategy("rooms")) {
            prop_assert_eq!(key.collection_path().to_string(), "rooms");
        }

        #[test]
        fn generated_mutations_target_the_collection(m in mutation_strategy("rooms")) {
            prop_assert_eq!(m.key().collection_path().to_string(), "rooms");
        }
    }
}
