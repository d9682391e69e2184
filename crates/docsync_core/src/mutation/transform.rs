//! Field transforms and preconditions.

use crate::model::{FieldPath, MutableDocument, SnapshotVersion};
use docsync_codec::{Timestamp, Value};
use serde::{Deserialize, Serialize};

/// A condition the target document must satisfy for a mutation to apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precondition {
    /// No condition.
    #[default]
    None,
    /// The document must (`true`) or must not (`false`) exist.
    Exists(bool),
    /// The document must exist at exactly this version.
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    /// Returns true if `doc` satisfies the condition.
    pub fn is_valid_for(&self, doc: &MutableDocument) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == doc.is_found_document(),
            Precondition::UpdateTime(version) => {
                doc.is_found_document() && doc.version() == *version
            }
        }
    }

    /// Returns true for [`Precondition::None`].
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }
}

/// A server-side operation on a single field.
///
/// Transforms are stored unresolved; they are evaluated against the
/// document's value at the time the mutation is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransformOperation {
    /// Replace the field with the commit time.
    ServerTimestamp,
    /// Add the operand to the field's numeric value.
    NumericIncrement(Value),
    /// Append elements that are not already present.
    ArrayUnion(Vec<Value>),
    /// Remove every occurrence of the elements.
    ArrayRemove(Vec<Value>),
}

impl TransformOperation {
    /// Computes the locally visible result of the transform.
    pub fn apply_to_local_view(&self, previous: Option<&Value>, local_write_time: Timestamp) -> Value {
        match self {
            TransformOperation::ServerTimestamp => {
                let previous_value = match previous {
                    Some(Value::ServerTimestamp { previous_value, .. }) => previous_value.clone(),
                    Some(value) => Some(Box::new(value.clone())),
                    None => None,
                };
                Value::ServerTimestamp {
                    local_write_time,
                    previous_value,
                }
            }
            TransformOperation::NumericIncrement(operand) => match previous {
                Some(value) if value.is_number() => add_numbers(value, operand),
                _ => add_numbers(&Value::Integer(0), operand),
            },
            TransformOperation::ArrayUnion(elements) => {
                let mut values = coerce_array(previous);
                for element in elements {
                    if !values.contains(element) {
                        values.push(element.clone());
                    }
                }
                Value::Array(values)
            }
            TransformOperation::ArrayRemove(elements) => {
                let mut values = coerce_array(previous);
                values.retain(|v| !elements.contains(v));
                Value::Array(values)
            }
        }
    }

    /// Computes the committed result of the transform.
    ///
    /// The backend reports the resolved value for timestamps and increments;
    /// array transforms are recomputed locally.
    pub fn apply_to_remote_document(&self, previous: Option<&Value>, server_result: Value) -> Value {
        match self {
            TransformOperation::ArrayUnion(_) | TransformOperation::ArrayRemove(_) => {
                self.apply_to_local_view(previous, Timestamp::MIN)
            }
            _ => server_result,
        }
    }
}

fn coerce_array(previous: Option<&Value>) -> Vec<Value> {
    previous
        .and_then(Value::as_array)
        .map(<[Value]>::to_vec)
        .unwrap_or_default()
}

fn add_numbers(base: &Value, operand: &Value) -> Value {
    match (base, operand) {
        (Value::Integer(a), Value::Integer(b)) => Value::Integer(a.saturating_add(*b)),
        _ => {
            let a = base.as_f64().unwrap_or(0.0);
            let b = operand.as_f64().unwrap_or(0.0);
            Value::Double(a + b)
        }
    }
}

/// A transform bound to a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldTransform {
    /// The transformed field.
    pub field: FieldPath,
    /// The operation.
    pub operation: TransformOperation,
}

impl FieldTransform {
    /// Creates a field transform.
    pub fn new(field: FieldPath, operation: TransformOperation) -> Self {
        Self { field, operation }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_integer_and_double() {
        let inc = TransformOperation::NumericIncrement(Value::Integer(2));
        assert_eq!(
            inc.apply_to_local_view(Some(&Value::Integer(5)), Timestamp::MIN),
            Value::Integer(7)
        );
        assert_eq!(
            inc.apply_to_local_view(Some(&Value::Double(0.5)), Timestamp::MIN),
            Value::Double(2.5)
        );
        assert_eq!(
            inc.apply_to_local_view(Some(&Value::from("x")), Timestamp::MIN),
            Value::Integer(2)
        );
        assert_eq!(
            inc.apply_to_local_view(Some(&Value::Integer(i64::MAX)), Timestamp::MIN),
            Value::Integer(i64::MAX)
        );
    }

    #[test]
    fn array_union_skips_existing() {
        let union = TransformOperation::ArrayUnion(vec![Value::Integer(1), Value::Integer(3)]);
        let previous = Value::Array(vec![Value::Integer(1), Value::Integer(2)]);
        assert_eq!(
            union.apply_to_local_view(Some(&previous), Timestamp::MIN),
            Value::Array(vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)])
        );
    }

    #[test]
    fn array_remove_drops_all_occurrences() {
        let remove = TransformOperation::ArrayRemove(vec![Value::Integer(1)]);
        let previous = Value::Array(vec![Value::Integer(1), Value::Integer(2), Value::Integer(1)]);
        assert_eq!(
            remove.apply_to_local_view(Some(&previous), Timestamp::MIN),
            Value::Array(vec![Value::Integer(2)])
        );
        assert_eq!(
            remove.apply_to_local_view(None, Timestamp::MIN),
            Value::Array(vec![])
        );
    }

    #[test]
    fn server_timestamp_keeps_original_previous_value() {
        let ts = TransformOperation::ServerTimestamp;
        let first = ts.apply_to_local_view(Some(&Value::Integer(1)), Timestamp::from_millis(10));
        let second = ts.apply_to_local_view(Some(&first), Timestamp::from_millis(20));
        match second {
            Value::ServerTimestamp {
                local_write_time,
                previous_value,
            } => {
                assert_eq!(local_write_time, Timestamp::from_millis(20));
                assert_eq!(previous_value.as_deref(), Some(&Value::Integer(1)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn remote_result_wins_for_timestamps() {
        let ts = TransformOperation::ServerTimestamp;
        let resolved = Value::Timestamp(Timestamp::from_millis(99));
        assert_eq!(ts.apply_to_remote_document(None, resolved.clone()), resolved);
    }
}
