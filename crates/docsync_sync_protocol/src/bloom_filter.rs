//! Bloom filter carried by existence filters.
//!
//! The backend hashes the full name of every document that still matches a
//! target into the filter. The client tests each document it believes
//! matches: a miss proves the document was removed; a hit may be a false
//! positive.

use crate::error::{ProtocolError, ProtocolResult};
use bytes::Bytes;
use docsync_core::DocumentKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Bloom filter as it arrives on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomFilterParams {
    /// Bit array, least significant bit first within each byte.
    pub bitmap: Bytes,
    /// Unused bits at the end of the last byte.
    pub padding: u8,
    /// Number of hash functions.
    pub hash_count: u32,
}

/// A validated bloom filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bitmap: Bytes,
    bit_count: u64,
    hash_count: u32,
}

impl BloomFilter {
    /// Creates a filter from its wire representation.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidBloomFilter`] if the padding is not
    /// below 8, or if an empty bitmap has padding, or if a non-empty bitmap
    /// has no hash functions.
    pub fn new(bitmap: Bytes, padding: u8, hash_count: u32) -> ProtocolResult<Self> {
        if padding >= 8 {
            return Err(ProtocolError::invalid_bloom_filter(format!(
                "padding {padding} is not below 8"
            )));
        }
        if bitmap.is_empty() && padding != 0 {
            return Err(ProtocolError::invalid_bloom_filter(format!(
                "empty bitmap with padding {padding}"
            )));
        }
        if !bitmap.is_empty() && hash_count == 0 {
            return Err(ProtocolError::invalid_bloom_filter(
                "non-empty bitmap with zero hash count",
            ));
        }
        let bit_count = bitmap.len() as u64 * 8 - u64::from(padding);
        Ok(Self {
            bitmap,
            bit_count,
            hash_count,
        })
    }

    /// Builds a filter holding `values`.
    ///
    /// # Errors
    ///
    /// Returns an error if `bit_count` is non-zero and `hash_count` is zero.
    pub fn from_values<'a>(
        values: impl IntoIterator<Item = &'a str>,
        bit_count: u64,
        hash_count: u32,
    ) -> ProtocolResult<Self> {
        let bytes = usize::try_from(bit_count.div_ceil(8))
            .map_err(|_| ProtocolError::invalid_bloom_filter("bitmap too large"))?;
        let padding = u8::try_from(bytes as u64 * 8 - bit_count)
            .map_err(|_| ProtocolError::invalid_bloom_filter("bitmap too large"))?;
        let mut bitmap = vec![0u8; bytes];
        if bit_count > 0 {
            for value in values {
                let (h1, h2) = hash(value);
                for i in 0..hash_count {
                    let index = bit_index(h1, h2, i, bit_count);
                    bitmap[(index / 8) as usize] |= 1 << (index % 8);
                }
            }
        }
        Self::new(Bytes::from(bitmap), padding, hash_count)
    }

    /// Builds a filter holding the names of `keys`.
    ///
    /// # Errors
    ///
    /// See [`BloomFilter::from_values`].
    pub fn from_keys<'a>(
        keys: impl IntoIterator<Item = &'a DocumentKey>,
        bit_count: u64,
        hash_count: u32,
    ) -> ProtocolResult<Self> {
        let names: Vec<String> = keys.into_iter().map(document_name).collect();
        Self::from_values(names.iter().map(String::as_str), bit_count, hash_count)
    }

    /// Returns the number of usable bits.
    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    /// Returns the number of hash functions.
    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    /// Returns the wire representation.
    pub fn to_params(&self) -> BloomFilterParams {
        BloomFilterParams {
            bitmap: self.bitmap.clone(),
            padding: (self.bitmap.len() as u64 * 8 - self.bit_count) as u8,
            hash_count: self.hash_count,
        }
    }

    /// Returns false if `value` is definitely not in the filter.
    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        let (h1, h2) = hash(value);
        (0..self.hash_count).all(|i| self.is_bit_set(bit_index(h1, h2, i, self.bit_count)))
    }

    /// Returns false if the document named by `key` is definitely not in
    /// the filter.
    pub fn might_contain_key(&self, key: &DocumentKey) -> bool {
        self.might_contain(&document_name(key))
    }

    fn is_bit_set(&self, index: u64) -> bool {
        let byte = self.bitmap[(index / 8) as usize];
        byte & (1 << (index % 8)) != 0
    }
}

impl TryFrom<BloomFilterParams> for BloomFilter {
    type Error = ProtocolError;

    fn try_from(params: BloomFilterParams) -> ProtocolResult<Self> {
        Self::new(params.bitmap, params.padding, params.hash_count)
    }
}

/// Name under which the backend hashes a document.
fn document_name(key: &DocumentKey) -> String {
    format!("documents/{}", key.path().canonical_string())
}

/// Splits the first 128 bits of the SHA-256 digest into two 64-bit halves.
fn hash(value: &str) -> (u64, u64) {
    let digest = Sha256::digest(value.as_bytes());
    let mut h1 = [0u8; 8];
    let mut h2 = [0u8; 8];
    h1.copy_from_slice(&digest[..8]);
    h2.copy_from_slice(&digest[8..16]);
    (u64::from_le_bytes(h1), u64::from_le_bytes(h2))
}

fn bit_index(h1: u64, h2: u64, i: u32, bit_count: u64) -> u64 {
    h1.wrapping_add(h2.wrapping_mul(u64::from(i))) % bit_count
}
