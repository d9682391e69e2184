//! Document data and field masks.

use super::path::FieldPath;
use docsync_codec::{MapValue, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// The field-value tree of a document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectValue {
    fields: MapValue,
}

impl ObjectValue {
    /// Creates an empty object.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Wraps a map of top-level fields.
    pub fn from_map(fields: MapValue) -> Self {
        Self { fields }
    }

    /// Builds an object from `(field, value)` pairs.
    pub fn from_pairs<K, I>(pairs: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Self {
            fields: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Returns the top-level fields.
    pub fn as_map(&self) -> &MapValue {
        &self.fields
    }

    /// Consumes the object and returns its top-level fields.
    pub fn into_map(self) -> MapValue {
        self.fields
    }

    /// Returns true if the object has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Returns the value at `path`.
    pub fn field(&self, path: &FieldPath) -> Option<&Value> {
        let (first, rest) = path.segments().split_first()?;
        let mut current = self.fields.get(first)?;
        for segment in rest {
            current = current.as_map()?.get(segment)?;
        }
        Some(current)
    }

    /// Sets the value at `path`, creating intermediate maps and replacing
    /// non-map intermediate values.
    pub fn set(&mut self, path: &FieldPath, value: Value) {
        let Some((last, parents)) = path.segments().split_last() else {
            return;
        };
        let mut current = &mut self.fields;
        for segment in parents {
            let entry = current
                .entry(segment.clone())
                .or_insert_with(Value::empty_map);
            if !entry.is_map() {
                *entry = Value::empty_map();
            }
            let Value::Map(next) = entry else {
                return;
            };
            current = next;
        }
        current.insert(last.clone(), value);
    }

    /// Removes the value at `path`. Missing parents are ignored.
    pub fn delete(&mut self, path: &FieldPath) {
        let Some((last, parents)) = path.segments().split_last() else {
            return;
        };
        let mut current = &mut self.fields;
        for segment in parents {
            match current.get_mut(segment) {
                Some(Value::Map(next)) => current = next,
                _ => return,
            }
        }
        current.remove(last);
    }

    /// Applies a set of writes. `None` deletes the field.
    pub fn set_all(&mut self, writes: BTreeMap<FieldPath, Option<Value>>) {
        for (path, value) in writes {
            match value {
                Some(value) => self.set(&path, value),
                None => self.delete(&path),
            }
        }
    }

    /// Returns the mask of every leaf field. Empty maps count as leaves.
    pub fn field_mask(&self) -> FieldMask {
        let mut fields = BTreeSet::new();
        collect_leaves(&self.fields, None, &mut fields);
        FieldMask { fields }
    }
}

fn collect_leaves(map: &MapValue, prefix: Option<&FieldPath>, out: &mut BTreeSet<FieldPath>) {
    for (name, value) in map {
        let path = match prefix {
            Some(prefix) => prefix.child(name.clone()),
            None => FieldPath::from_single_segment(name.clone()),
        };
        match value {
            Value::Map(nested) if !nested.is_empty() => collect_leaves(nested, Some(&path), out),
            _ => {
                out.insert(path);
            }
        }
    }
}

/// A set of field paths, used to limit patches to specific fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMask {
    fields: BTreeSet<FieldPath>,
}

impl FieldMask {
    /// Creates an empty mask.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns the paths in the mask.
    pub fn fields(&self) -> impl Iterator<Item = &FieldPath> + '_ {
        self.fields.iter()
    }

    /// Returns the number of paths.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if the mask has no paths.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Returns true if `path` is in the mask or below one of its paths.
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|f| f.is_prefix_of(path))
    }

    /// Adds a path.
    pub fn insert(&mut self, path: FieldPath) {
        self.fields.insert(path);
    }

    /// Returns the union of two masks.
    #[must_use]
    pub fn union(&self, other: &FieldMask) -> FieldMask {
        FieldMask {
            fields: self.fields.union(&other.fields).cloned().collect(),
        }
    }
}

impl FromIterator<FieldPath> for FieldMask {
    fn from_iter<I: IntoIterator<Item = FieldPath>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> FieldPath {
        FieldPath::parse(s).unwrap()
    }

    #[test]
    fn set_creates_intermediate_maps() {
        let mut obj = ObjectValue::empty();
        obj.set(&path("a.b.c"), Value::Integer(1));
        assert_eq!(obj.field(&path("a.b.c")), Some(&Value::Integer(1)));
        assert!(obj.field(&path("a.b")).unwrap().is_map());
    }

    #[test]
    fn set_replaces_scalar_parent() {
        let mut obj = ObjectValue::from_pairs([("a", Value::Integer(1))]);
        obj.set(&path("a.b"), Value::from("x"));
        assert_eq!(obj.field(&path("a.b")), Some(&Value::from("x")));
    }

    #[test]
    fn delete_ignores_missing_parent() {
        let mut obj = ObjectValue::from_pairs([("a", Value::Integer(1))]);
        obj.delete(&path("x.y"));
        obj.delete(&path("a.b"));
        assert_eq!(obj.field(&path("a")), Some(&Value::Integer(1)));
        obj.delete(&path("a"));
        assert!(obj.is_empty());
    }

    #[test]
    fn field_mask_lists_leaves() {
        let obj = ObjectValue::from_pairs([
            ("a", Value::map([("b", Value::Integer(1)), ("c", Value::Null)])),
            ("d", Value::empty_map()),
            ("e", Value::Boolean(true)),
        ]);
        let mask: Vec<String> = obj.field_mask().fields().map(|f| f.to_string()).collect();
        assert_eq!(mask, vec!["a.b", "a.c", "d", "e"]);
    }

    #[test]
    fn mask_covers_children() {
        let mask: FieldMask = [path("a"), path("b.c")].into_iter().collect();
        assert!(mask.covers(&path("a.x")));
        assert!(mask.covers(&path("b.c")));
        assert!(!mask.covers(&path("b")));
    }
}
