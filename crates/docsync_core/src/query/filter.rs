//! Field filters.

use crate::model::{FieldPath, MutableDocument};
use docsync_codec::Value;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    /// `<`
    LessThan,
    /// `<=`
    LessThanOrEqual,
    /// `==`
    Equal,
    /// `!=`
    NotEqual,
    /// `>=`
    GreaterThanOrEqual,
    /// `>`
    GreaterThan,
    /// Array field contains the value.
    ArrayContains,
    /// Field equals one of the values.
    In,
    /// Array field contains one of the values.
    ArrayContainsAny,
    /// Field equals none of the values.
    NotIn,
}

impl Operator {
    /// Returns true for range and negative operators.
    pub fn is_inequality(self) -> bool {
        matches!(
            self,
            Operator::LessThan
                | Operator::LessThanOrEqual
                | Operator::GreaterThan
                | Operator::GreaterThanOrEqual
                | Operator::NotEqual
                | Operator::NotIn
        )
    }

    fn symbol(self) -> &'static str {
        match self {
            Operator::LessThan => "<",
            Operator::LessThanOrEqual => "<=",
            Operator::Equal => "==",
            Operator::NotEqual => "!=",
            Operator::GreaterThanOrEqual => ">=",
            Operator::GreaterThan => ">",
            Operator::ArrayContains => "array-contains",
            Operator::In => "in",
            Operator::ArrayContainsAny => "array-contains-any",
            Operator::NotIn => "not-in",
        }
    }

    fn matches_ordering(self, ordering: Ordering) -> bool {
        match self {
            Operator::LessThan => ordering == Ordering::Less,
            Operator::LessThanOrEqual => ordering != Ordering::Greater,
            Operator::Equal => ordering == Ordering::Equal,
            Operator::NotEqual => ordering != Ordering::Equal,
            Operator::GreaterThanOrEqual => ordering != Ordering::Less,
            Operator::GreaterThan => ordering == Ordering::Greater,
            _ => false,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// A `field op value` predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    /// Filtered field.
    pub field: FieldPath,
    /// Operator.
    pub op: Operator,
    /// Comparison operand.
    pub value: Value,
}

impl FieldFilter {
    /// Creates a filter.
    pub fn new(field: FieldPath, op: Operator, value: impl Into<Value>) -> Self {
        Self {
            field,
            op,
            value: value.into(),
        }
    }

    /// Returns true if `doc` satisfies the filter.
    pub fn matches(&self, doc: &MutableDocument) -> bool {
        let Some(other) = doc.field_value(&self.field) else {
            return false;
        };
        match self.op {
            Operator::ArrayContains => other.array_contains(&self.value),
            Operator::ArrayContainsAny => match (other.as_array(), self.value.as_array()) {
                (Some(values), Some(candidates)) => values.iter().any(|v| candidates.contains(v)),
                _ => false,
            },
            Operator::In => self.value.array_contains(&other),
            Operator::NotIn => {
                let Some(excluded) = self.value.as_array() else {
                    return false;
                };
                !excluded.contains(&Value::Null) && !other.is_null() && !excluded.contains(&other)
            }
            Operator::NotEqual => {
                !other.is_null() && self.op.matches_ordering(other.compare(&self.value))
            }
            op => {
                other.type_order() == self.value.type_order()
                    && op.matches_ordering(other.compare(&self.value))
            }
        }
    }

    /// Returns true for equality filters usable as an index prefix.
    pub fn is_equality(&self) -> bool {
        self.op == Operator::Equal
    }

    /// Returns a stable textual form.
    pub fn canonical_id(&self) -> String {
        format!("{}{}{}", self.field.canonical_string(), self.op, self.value.canonical_id())
    }
}
