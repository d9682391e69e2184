//! Sort orders and cursors.

use crate::model::{DocumentKey, FieldPath, MutableDocument};
use docsync_codec::Value;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Smallest first.
    #[default]
    Ascending,
    /// Largest first.
    Descending,
}

impl Direction {
    /// Returns the opposite direction.
    pub fn reversed(self) -> Self {
        match self {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
        }
    }

    fn apply(self, ordering: Ordering) -> Ordering {
        match self {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }
}

/// One sort key of a query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    /// Sorted field.
    pub field: FieldPath,
    /// Direction.
    pub direction: Direction,
}

impl OrderBy {
    /// Creates a sort key.
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    /// Ascending sort on `field`.
    pub fn asc(field: FieldPath) -> Self {
        Self::new(field, Direction::Ascending)
    }

    /// Descending sort on `field`.
    pub fn desc(field: FieldPath) -> Self {
        Self::new(field, Direction::Descending)
    }

    /// Compares two documents on this key. Missing fields sort first.
    pub fn compare(&self, a: &MutableDocument, b: &MutableDocument) -> Ordering {
        let ordering = if self.field.is_key_field() {
            a.key().cmp(b.key())
        } else {
            match (a.field(&self.field), b.field(&self.field)) {
                (Some(x), Some(y)) => x.compare(y),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        };
        self.direction.apply(ordering)
    }

    /// Returns a stable textual form.
    pub fn canonical_id(&self) -> String {
        let dir = match self.direction {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        };
        format!("{}{}", self.field.canonical_string(), dir)
    }
}

/// A query cursor: a position in the sort order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    /// Values of the sort keys, in sort-key order.
    pub position: Vec<Value>,
    /// Whether documents exactly at the position are included.
    pub inclusive: bool,
}

impl Bound {
    /// Creates a bound.
    pub fn new(position: Vec<Value>, inclusive: bool) -> Self {
        Self {
            position,
            inclusive,
        }
    }

    fn compare_to_document(&self, order_by: &[OrderBy], doc: &MutableDocument) -> Ordering {
        for (component, order) in self.position.iter().zip(order_by) {
            let ordering = if order.field.is_key_field() {
                match component.as_reference().and_then(|r| DocumentKey::parse(r).ok()) {
                    Some(key) => key.cmp(doc.key()),
                    None => Ordering::Less,
                }
            } else {
                match doc.field(&order.field) {
                    Some(value) => component.compare(value),
                    None => Ordering::Greater,
                }
            };
            let ordering = order.direction.apply(ordering);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Returns true if a start cursor admits `doc`.
    pub fn sorts_before_document(&self, order_by: &[OrderBy], doc: &MutableDocument) -> bool {
        let ordering = self.compare_to_document(order_by, doc);
        if self.inclusive {
            ordering != Ordering::Greater
        } else {
            ordering == Ordering::Less
        }
    }

    /// Returns true if an end cursor admits `doc`.
    pub fn sorts_after_document(&self, order_by: &[OrderBy], doc: &MutableDocument) -> bool {
        let ordering = self.compare_to_document(order_by, doc);
        if self.inclusive {
            ordering != Ordering::Less
        } else {
            ordering == Ordering::Greater
        }
    }

    /// Returns a stable textual form.
    pub fn canonical_id(&self) -> String {
        let values: Vec<String> = self.position.iter().map(Value::canonical_id).collect();
        format!("{}{}", if self.inclusive { "b:" } else { "a:" }, values.join(","))
    }
}
