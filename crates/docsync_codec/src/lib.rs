//! # docsync Codec
//!
//! Document field values and canonical CBOR encoding for docsync.
//!
//! This crate provides:
//! - [`Value`], the field-value tree stored in documents, with a total
//!   cross-type ordering used by queries and indexes
//! - [`Timestamp`] and [`GeoPoint`] leaf types
//! - Deterministic CBOR encoding of persisted records
//!
//! ## Usage
//!
//! ```
//! use docsync_codec::{from_cbor, to_canonical_cbor, Value};
//!
//! let value = Value::map([("name", Value::from("Ann"))]);
//! let bytes = to_canonical_cbor(&value).unwrap();
//! let decoded: Value = from_cbor(&bytes).unwrap();
//! assert_eq!(value, decoded);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod encoder;
mod error;
mod timestamp;
mod value;

pub use encoder::{from_cbor, to_canonical_cbor};
pub use error::{CodecError, CodecResult};
pub use timestamp::Timestamp;
pub use value::{GeoPoint, MapValue, Value};

/// Trait for records that can be encoded to canonical CBOR.
pub trait Encode {
    /// Encode this record to canonical CBOR bytes.
    fn encode(&self) -> CodecResult<Vec<u8>>;
}

/// Trait for records that can be decoded from CBOR.
pub trait Decode: Sized {
    /// Decode this record from CBOR bytes.
    fn decode(bytes: &[u8]) -> CodecResult<Self>;
}

impl<T: serde::Serialize> Encode for T {
    fn encode(&self) -> CodecResult<Vec<u8>> {
        to_canonical_cbor(self)
    }
}

impl<T: serde::de::DeserializeOwned> Decode for T {
    fn decode(bytes: &[u8]) -> CodecResult<Self> {
        from_cbor(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_nested_document() {
        let value = Value::map([
            ("name", Value::from("Ann")),
            ("score", Value::Double(9.5)),
            ("seen", Value::Timestamp(Timestamp::from_millis(42))),
            (
                "tags",
                Value::Array(vec![Value::from("a"), Value::Integer(3), Value::Null]),
            ),
            (
                "pending",
                Value::ServerTimestamp {
                    local_write_time: Timestamp::from_millis(7),
                    previous_value: Some(Box::new(Value::Integer(1))),
                },
            ),
        ]);
        let bytes = value.encode().unwrap();
        let decoded = Value::decode(&bytes).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn encoding_is_deterministic() {
        let a = Value::map([("x", Value::Integer(1)), ("y", Value::Integer(2))]);
        let b = Value::map([("y", Value::Integer(2)), ("x", Value::Integer(1))]);
        assert_eq!(a.encode().unwrap(), b.encode().unwrap());
    }
}
