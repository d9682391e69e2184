//! Dynamic document field values.

use crate::timestamp::Timestamp;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// A map of field names to values, kept sorted by field name.
pub type MapValue = BTreeMap<String, Value>;

/// A latitude/longitude pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
}

impl GeoPoint {
    /// Creates a new geo point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// A document field value.
///
/// Values of different types are totally ordered by type first
/// (null < boolean < number < timestamp < pending server timestamp < string <
/// bytes < reference < geo point < array < map), then by content. Integers and
/// doubles share the "number" type and compare numerically; NaN sorts before
/// every other number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Boolean(bool),
    /// 64-bit signed integer.
    Integer(i64),
    /// 64-bit float.
    Double(f64),
    /// Timestamp value.
    Timestamp(Timestamp),
    /// A server timestamp written locally and not yet resolved by the
    /// backend.
    ServerTimestamp {
        /// Local time of the write that produced the sentinel.
        local_write_time: Timestamp,
        /// The value the field held before the write, if any.
        previous_value: Option<Box<Value>>,
    },
    /// UTF-8 string.
    String(String),
    /// Byte string.
    Bytes(Vec<u8>),
    /// Reference to another document, as a slash-separated path.
    Reference(String),
    /// Geographic point.
    GeoPoint(GeoPoint),
    /// Ordered list of values.
    Array(Vec<Value>),
    /// Nested map.
    Map(MapValue),
}

/// Type ordering ranks.
mod type_order {
    pub const NULL: u8 = 0;
    pub const BOOLEAN: u8 = 1;
    pub const NUMBER: u8 = 2;
    pub const TIMESTAMP: u8 = 3;
    pub const SERVER_TIMESTAMP: u8 = 4;
    pub const STRING: u8 = 5;
    pub const BYTES: u8 = 6;
    pub const REFERENCE: u8 = 7;
    pub const GEO_POINT: u8 = 8;
    pub const ARRAY: u8 = 9;
    pub const MAP: u8 = 10;
}

impl Value {
    /// Returns an empty map value.
    pub fn empty_map() -> Self {
        Value::Map(MapValue::new())
    }

    /// Builds a map value from `(field, value)` pairs.
    pub fn map<K, I>(pairs: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Map(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Rank of this value's type in the cross-type ordering.
    pub fn type_order(&self) -> u8 {
        match self {
            Value::Null => type_order::NULL,
            Value::Boolean(_) => type_order::BOOLEAN,
            Value::Integer(_) | Value::Double(_) => type_order::NUMBER,
            Value::Timestamp(_) => type_order::TIMESTAMP,
            Value::ServerTimestamp { .. } => type_order::SERVER_TIMESTAMP,
            Value::String(_) => type_order::STRING,
            Value::Bytes(_) => type_order::BYTES,
            Value::Reference(_) => type_order::REFERENCE,
            Value::GeoPoint(_) => type_order::GEO_POINT,
            Value::Array(_) => type_order::ARRAY,
            Value::Map(_) => type_order::MAP,
        }
    }

    /// Human readable type name, used in validation messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Double(_) => "double",
            Value::Timestamp(_) => "timestamp",
            Value::ServerTimestamp { .. } => "server timestamp",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Reference(_) => "reference",
            Value::GeoPoint(_) => "geo point",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
        }
    }

    /// Compares two values using the cross-type ordering.
    pub fn compare(&self, other: &Value) -> Ordering {
        let left = self.type_order();
        let right = other.type_order();
        if left != right {
            return left.cmp(&right);
        }

        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Integer(a), Value::Double(b)) => compare_mixed(*a, *b),
            (Value::Double(a), Value::Integer(b)) => compare_mixed(*b, *a).reverse(),
            (Value::Double(a), Value::Double(b)) => compare_doubles(*a, *b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (
                Value::ServerTimestamp {
                    local_write_time: a,
                    ..
                },
                Value::ServerTimestamp {
                    local_write_time: b,
                    ..
                },
            ) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Reference(a), Value::Reference(b)) => a
                .split('/')
                .filter(|s| !s.is_empty())
                .cmp(b.split('/').filter(|s| !s.is_empty())),
            (Value::GeoPoint(a), Value::GeoPoint(b)) => compare_doubles(a.latitude, b.latitude)
                .then_with(|| compare_doubles(a.longitude, b.longitude)),
            (Value::Array(a), Value::Array(b)) => {
                for (av, bv) in a.iter().zip(b.iter()) {
                    let ord = av.compare(bv);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Map(a), Value::Map(b)) => {
                for ((ak, av), (bk, bv)) in a.iter().zip(b.iter()) {
                    let ord = ak.cmp(bk).then_with(|| av.compare(bv));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => Ordering::Equal,
        }
    }

    /// A stable string form used to build canonical query ids.
    pub fn canonical_id(&self) -> String {
        let mut out = String::new();
        self.write_canonical(&mut out);
        out
    }

    fn write_canonical(&self, out: &mut String) {
        match self {
            Value::Null => out.push_str("null"),
            Value::Boolean(b) => {
                let _ = write!(out, "{b}");
            }
            Value::Integer(n) => {
                let _ = write!(out, "{n}");
            }
            Value::Double(d) => {
                let _ = write!(out, "{d:?}");
            }
            Value::Timestamp(t) => {
                let _ = write!(out, "{t}");
            }
            Value::ServerTimestamp {
                local_write_time, ..
            } => {
                let _ = write!(out, "server_timestamp({local_write_time})");
            }
            Value::String(s) => out.push_str(s),
            Value::Bytes(bytes) => {
                out.push_str("bytes(");
                for byte in bytes {
                    let _ = write!(out, "{byte:02x}");
                }
                out.push(')');
            }
            Value::Reference(path) => {
                let _ = write!(out, "ref({path})");
            }
            Value::GeoPoint(p) => {
                let _ = write!(out, "geo({:?},{:?})", p.latitude, p.longitude);
            }
            Value::Array(values) => {
                out.push('[');
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    v.write_canonical(out);
                }
                out.push(']');
            }
            Value::Map(fields) => {
                out.push('{');
                for (i, (k, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(k);
                    out.push(':');
                    v.write_canonical(out);
                }
                out.push('}');
            }
        }
    }

    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Check if this value is an integer or a double.
    pub fn is_number(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::Double(_))
    }

    /// Check if this value is a NaN double.
    pub fn is_nan(&self) -> bool {
        matches!(self, Value::Double(d) if d.is_nan())
    }

    /// Check if this value is a pending server timestamp.
    pub fn is_server_timestamp(&self) -> bool {
        matches!(self, Value::ServerTimestamp { .. })
    }

    /// Check if this value is an array.
    pub fn is_array(&self) -> bool {
        matches!(self, Value::Array(_))
    }

    /// Check if this value is a map.
    pub fn is_map(&self) -> bool {
        matches!(self, Value::Map(_))
    }

    /// Get this value as a boolean, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Get this value as an integer, if it is one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Get this value as a double, if it is any number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(n) => Some(*n as f64),
            Value::Double(d) => Some(*d),
            _ => None,
        }
    }

    /// Get this value as a string slice, if it is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get the referenced document path, if this is a reference.
    pub fn as_reference(&self) -> Option<&str> {
        match self {
            Value::Reference(path) => Some(path),
            _ => None,
        }
    }

    /// Get this value as a slice of values, if it is an array.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(values) => Some(values),
            _ => None,
        }
    }

    /// Get this value as a map, if it is one.
    pub fn as_map(&self) -> Option<&MapValue> {
        match self {
            Value::Map(fields) => Some(fields),
            _ => None,
        }
    }

    /// Get a mutable map, if this value is one.
    pub fn as_map_mut(&mut self) -> Option<&mut MapValue> {
        match self {
            Value::Map(fields) => Some(fields),
            _ => None,
        }
    }

    /// Returns true if `needle` is an element of this array value.
    pub fn array_contains(&self, needle: &Value) -> bool {
        self.as_array()
            .map(|values| values.iter().any(|v| v == needle))
            .unwrap_or(false)
    }
}

fn compare_doubles(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

fn compare_mixed(int: i64, double: f64) -> Ordering {
    if double.is_nan() {
        return Ordering::Greater;
    }
    compare_doubles(int as f64, double)
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => {
                (a.is_nan() && b.is_nan()) || a.to_bits() == b.to_bits()
            }
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            (
                Value::ServerTimestamp {
                    local_write_time: a,
                    ..
                },
                Value::ServerTimestamp {
                    local_write_time: b,
                    ..
                },
            ) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Reference(a), Value::Reference(b)) => a == b,
            (Value::GeoPoint(a), Value::GeoPoint(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<Timestamp> for Value {
    fn from(t: Timestamp) -> Self {
        Value::Timestamp(t)
    }
}

impl From<GeoPoint> for Value {
    fn from(p: GeoPoint) -> Self {
        Value::GeoPoint(p)
    }
}

impl From<Vec<Value>> for Value {
    fn from(values: Vec<Value>) -> Self {
        Value::Array(values)
    }
}

impl From<MapValue> for Value {
    fn from(fields: MapValue) -> Self {
        Value::Map(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cross_type_ordering() {
        let ordered = vec![
            Value::Null,
            Value::Boolean(false),
            Value::Boolean(true),
            Value::Double(f64::NAN),
            Value::Integer(-5),
            Value::Double(1.5),
            Value::Integer(2),
            Value::Timestamp(Timestamp::from_millis(1)),
            Value::ServerTimestamp {
                local_write_time: Timestamp::from_millis(0),
                previous_value: None,
            },
            Value::String("a".into()),
            Value::Bytes(vec![0]),
            Value::Reference("a/b".into()),
            Value::GeoPoint(GeoPoint::new(0.0, 0.0)),
            Value::Array(vec![]),
            Value::empty_map(),
        ];
        for pair in ordered.windows(2) {
            assert_eq!(
                pair[0].compare(&pair[1]),
                Ordering::Less,
                "{:?} < {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn numbers_compare_across_representations() {
        assert_eq!(Value::Integer(1).compare(&Value::Double(1.0)), Ordering::Equal);
        assert_eq!(Value::Double(2.5).compare(&Value::Integer(2)), Ordering::Greater);
        // Equality keeps representations apart.
        assert_ne!(Value::Integer(1), Value::Double(1.0));
        assert_eq!(Value::Double(f64::NAN), Value::Double(f64::NAN));
        assert_ne!(Value::Double(0.0), Value::Double(-0.0));
    }

    #[test]
    fn arrays_and_maps_compare_lexicographically() {
        let short = Value::Array(vec![Value::Integer(1)]);
        let long = Value::Array(vec![Value::Integer(1), Value::Integer(0)]);
        assert_eq!(short.compare(&long), Ordering::Less);

        let a = Value::map([("a", Value::Integer(1))]);
        let b = Value::map([("b", Value::Integer(0))]);
        assert_eq!(a.compare(&b), Ordering::Less);
    }

    #[test]
    fn references_compare_by_segment() {
        let a = Value::Reference("coll/a".into());
        let b = Value::Reference("coll/a/sub/b".into());
        assert_eq!(a.compare(&b), Ordering::Less);
    }

    #[test]
    fn canonical_ids_are_stable() {
        let value = Value::map([
            ("b", Value::Array(vec![Value::Integer(1), Value::Null])),
            ("a", Value::String("x".into())),
        ]);
        assert_eq!(value.canonical_id(), "{a:x,b:[1,null]}");
        assert_eq!(Value::Bytes(vec![0xab, 0x01]).canonical_id(), "bytes(ab01)");
    }

    #[test]
    fn array_contains_uses_value_equality() {
        let array = Value::Array(vec![Value::Integer(1), Value::String("x".into())]);
        assert!(array.array_contains(&Value::String("x".into())));
        assert!(!array.array_contains(&Value::Double(1.0)));
        assert!(!Value::Null.array_contains(&Value::Null));
    }

    fn scalar() -> impl proptest::strategy::Strategy<Value = Value> {
        use proptest::prelude::*;
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Boolean),
            (-100i64..100).prop_map(Value::Integer),
            (-100.0f64..100.0).prop_map(Value::Double),
            "[a-c]{0,3}".prop_map(Value::String),
            prop::collection::vec(0u8..4, 0..3).prop_map(Value::Bytes),
        ]
    }

    proptest::proptest! {
        #[test]
        fn ordering_is_antisymmetric(a in scalar(), b in scalar()) {
            proptest::prop_assert_eq!(a.compare(&b), b.compare(&a).reverse());
        }

        #[test]
        fn type_order_dominates(a in scalar(), b in scalar()) {
            if a.type_order() != b.type_order() {
                proptest::prop_assert_eq!(a.compare(&b), a.type_order().cmp(&b.type_order()));
            }
        }
    }
}
