//! Application-supplied document data and its conversion to mutations.
//!
//! [`DocumentData`] maps dotted field paths to [`FieldValue`]s. Plain
//! values are written as-is; sentinels become field transforms or, for
//! updates, field deletes.

use crate::error::{SyncError, SyncResult};
use docsync_codec::{Timestamp, Value};
use docsync_core::{DocumentKey, FieldMask, FieldPath, Mutation, ObjectValue, Precondition, TransformOperation};

/// A field value or a write sentinel.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// A plain value.
    Value(Value),
    /// Removes the field. Only valid in updates and merges.
    Delete,
    /// Replaced by the commit time on the backend.
    ServerTimestamp,
    /// Adds to the current numeric value.
    Increment(Value),
    /// Appends elements that are not present yet.
    ArrayUnion(Vec<Value>),
    /// Removes all instances of the elements.
    ArrayRemove(Vec<Value>),
}

impl FieldValue {
    /// Sentinel deleting the field.
    pub fn delete() -> Self {
        FieldValue::Delete
    }

    /// Sentinel for the backend's commit time.
    pub fn server_timestamp() -> Self {
        FieldValue::ServerTimestamp
    }

    /// Sentinel adding `n` to the field.
    pub fn increment(n: impl Into<Value>) -> Self {
        FieldValue::Increment(n.into())
    }

    /// Sentinel adding the elements to an array field.
    pub fn array_union(elements: impl IntoIterator<Item = Value>) -> Self {
        FieldValue::ArrayUnion(elements.into_iter().collect())
    }

    /// Sentinel removing the elements from an array field.
    pub fn array_remove(elements: impl IntoIterator<Item = Value>) -> Self {
        FieldValue::ArrayRemove(elements.into_iter().collect())
    }

    fn transform(&self) -> Option<TransformOperation> {
        match self {
            FieldValue::ServerTimestamp => Some(TransformOperation::ServerTimestamp),
            FieldValue::Increment(n) => Some(TransformOperation::NumericIncrement(n.clone())),
            FieldValue::ArrayUnion(elements) => Some(TransformOperation::ArrayUnion(elements.clone())),
            FieldValue::ArrayRemove(elements) => Some(TransformOperation::ArrayRemove(elements.clone())),
            FieldValue::Value(_) | FieldValue::Delete => None,
        }
    }
}

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        FieldValue::Value(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Value(value.into())
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Value(value.into())
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Value(value.into())
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Value(value.into())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Value(value.into())
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Value(value.into())
    }
}

impl From<Timestamp> for FieldValue {
    fn from(value: Timestamp) -> Self {
        FieldValue::Value(value.into())
    }
}

impl From<Vec<Value>> for FieldValue {
    fn from(value: Vec<Value>) -> Self {
        FieldValue::Value(value.into())
    }
}

/// Field values keyed by dotted field path, in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentData {
    fields: Vec<(String, FieldValue)>,
}

impl DocumentData {
    /// Creates empty document data.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field. `path` may be dotted (`"address.city"`).
    #[must_use]
    pub fn with(mut self, path: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.push((path.into(), value.into()));
        self
    }

    /// Returns true if no fields were added.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn parsed_fields(&self) -> SyncResult<Vec<(FieldPath, &FieldValue)>> {
        self.fields
            .iter()
            .map(|(path, value)| {
                let path = FieldPath::parse(path)
                    .map_err(|e| SyncError::validation(format!("invalid field path {path:?}: {e}")))?;
                if path.is_key_field() {
                    return Err(SyncError::validation("the document key cannot be written as a field"));
                }
                Ok((path, value))
            })
            .collect()
    }
}

/// How `set` treats fields that are not in the new data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SetOptions {
    /// Replace the whole document.
    #[default]
    Overwrite,
    /// Write the given fields and keep the rest. Nested maps are replaced
    /// as a whole.
    Merge,
    /// Write only the listed fields, taken from the data.
    MergeFields(Vec<String>),
}

#[derive(Debug, Default)]
struct ParsedData {
    value: ObjectValue,
    mask: FieldMask,
    transforms: Vec<(FieldPath, TransformOperation)>,
}

impl ParsedData {
    fn into_mutation(self, key: DocumentKey, patch: bool) -> Mutation {
        let mutation = if patch {
            Mutation::patch(key, self.value, self.mask)
        } else {
            Mutation::set(key, self.value)
        };
        self.transforms
            .into_iter()
            .fold(mutation, |m, (path, op)| m.with_transform(path, op))
    }
}

fn parse(fields: Vec<(FieldPath, &FieldValue)>, allow_delete: bool, operation: &str) -> SyncResult<ParsedData> {
    let mut parsed = ParsedData::default();
    for (path, value) in fields {
        match value {
            FieldValue::Value(v) => {
                parsed.value.set(&path, v.clone());
                parsed.mask.insert(path);
            }
            FieldValue::Delete if allow_delete => parsed.mask.insert(path),
            FieldValue::Delete => {
                return Err(SyncError::validation(format!(
                    "FieldValue::delete() cannot be used with {operation} (field {path})"
                )));
            }
            sentinel => {
                if let Some(op) = sentinel.transform() {
                    parsed.transforms.push((path, op));
                }
            }
        }
    }
    Ok(parsed)
}

/// Converts `set` data into a mutation.
pub(crate) fn parse_set(key: DocumentKey, data: &DocumentData, options: &SetOptions) -> SyncResult<Mutation> {
    let fields = data.parsed_fields()?;
    match options {
        SetOptions::Overwrite => Ok(parse(fields, false, "set")?.into_mutation(key, false)),
        SetOptions::Merge => Ok(parse(fields, true, "set with merge")?.into_mutation(key, true)),
        SetOptions::MergeFields(paths) => {
            let mut selected = Vec::with_capacity(paths.len());
            for raw in paths {
                let path = FieldPath::parse(raw)
                    .map_err(|e| SyncError::validation(format!("invalid merge field {raw:?}: {e}")))?;
                let Some((_, value)) = fields.iter().find(|(p, _)| *p == path) else {
                    return Err(SyncError::validation(format!(
                        "merge field {path} is not present in the data"
                    )));
                };
                selected.push((path, *value));
            }
            Ok(parse(selected, true, "set with merge fields")?.into_mutation(key, true))
        }
    }
}

/// Converts `update` data into a mutation. The document must exist.
pub(crate) fn parse_update(key: DocumentKey, data: &DocumentData) -> SyncResult<Mutation> {
    if data.is_empty() {
        return Err(SyncError::validation("update requires at least one field"));
    }
    let parsed = parse(data.parsed_fields()?, true, "update")?;
    Ok(parsed
        .into_mutation(key, true)
        .with_precondition(Precondition::Exists(true)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_core::MutationKind;

    fn key() -> DocumentKey {
        DocumentKey::parse("rooms/eros").unwrap()
    }

    fn field(path: &str) -> FieldPath {
        FieldPath::parse(path).unwrap()
    }

    #[test]
    fn overwrite_set_writes_values_and_transforms() {
        let data = DocumentData::new()
            .with("name", "Eros")
            .with("meta.visits", 3i64)
            .with("updated", FieldValue::server_timestamp());
        let mutation = parse_set(key(), &data, &SetOptions::Overwrite).unwrap();

        let MutationKind::Set { value } = mutation.kind() else {
            panic!("expected a set, got {:?}", mutation.kind());
        };
        assert_eq!(value.field(&field("name")), Some(&Value::from("Eros")));
        assert_eq!(value.field(&field("meta.visits")), Some(&Value::Integer(3)));
        assert_eq!(mutation.field_transforms().len(), 1);
        assert_eq!(mutation.field_transforms()[0].field, field("updated"));
        assert!(mutation.precondition().is_none());
    }

    #[test]
    fn delete_sentinel_is_rejected_by_plain_set() {
        let data = DocumentData::new().with("name", FieldValue::delete());
        let err = parse_set(key(), &data, &SetOptions::Overwrite).unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[test]
    fn merge_masks_written_and_deleted_fields() {
        let data = DocumentData::new()
            .with("name", "Eros")
            .with("old", FieldValue::delete())
            .with("count", FieldValue::increment(1i64));
        let mutation = parse_set(key(), &data, &SetOptions::Merge).unwrap();

        let mask = mutation.field_mask().unwrap();
        assert!(mask.covers(&field("name")));
        assert!(mask.covers(&field("old")));
        assert!(!mask.covers(&field("count")));
        assert_eq!(mutation.field_transforms().len(), 1);
    }

    #[test]
    fn merge_fields_picks_listed_fields_only() {
        let data = DocumentData::new().with("a", 1i64).with("b", 2i64);
        let mutation = parse_set(key(), &data, &SetOptions::MergeFields(vec!["b".into()])).unwrap();
        let mask = mutation.field_mask().unwrap();
        assert_eq!(mask.len(), 1);
        assert!(mask.covers(&field("b")));

        let err = parse_set(key(), &data, &SetOptions::MergeFields(vec!["c".into()])).unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[test]
    fn update_requires_existing_document_and_fields() {
        let mutation = parse_update(key(), &DocumentData::new().with("n", 1i64)).unwrap();
        assert_eq!(mutation.precondition(), &Precondition::Exists(true));
        assert!(parse_update(key(), &DocumentData::new()).is_err());
    }

    #[test]
    fn invalid_paths_are_validation_errors() {
        let data = DocumentData::new().with("a..b", 1i64);
        let err = parse_update(key(), &data).unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }
}
