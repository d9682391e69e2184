//! Canonical CBOR encoding of persisted records.

use crate::error::{CodecError, CodecResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes a record to CBOR bytes.
///
/// Output is deterministic for docsync records: maps are `BTreeMap`s, so keys
/// are always emitted in sorted order, and ciborium uses the shortest
/// integer encoding and definite lengths.
///
/// # Errors
///
/// Returns an error if the record cannot be serialized.
pub fn to_canonical_cbor<T: Serialize + ?Sized>(record: &T) -> CodecResult<Vec<u8>> {
    let mut buffer = Vec::new();
    ciborium::ser::into_writer(record, &mut buffer)
        .map_err(|e| CodecError::encoding_failed(e.to_string()))?;
    Ok(buffer)
}

/// Decodes a record from CBOR bytes.
///
/// # Errors
///
/// Returns an error if the bytes are not valid CBOR or do not match the
/// shape of `T`.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    ciborium::de::from_reader(bytes).map_err(|e| CodecError::decoding_failed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn map_encoding_is_order_independent() {
        let mut a = BTreeMap::new();
        a.insert("b".to_string(), 2);
        a.insert("a".to_string(), 1);

        let mut b = BTreeMap::new();
        b.insert("a".to_string(), 1);
        b.insert("b".to_string(), 2);

        assert_eq!(to_canonical_cbor(&a).unwrap(), to_canonical_cbor(&b).unwrap());
    }

    #[test]
    fn small_integers_use_one_byte() {
        assert_eq!(to_canonical_cbor(&7u64).unwrap(), vec![0x07]);
    }

    #[test]
    fn garbage_fails_to_decode() {
        let err = from_cbor::<BTreeMap<String, i64>>(&[0xff, 0x00]).unwrap_err();
        assert!(matches!(err, CodecError::DecodingFailed { .. }));
    }
}
