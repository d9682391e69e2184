//! Error types for the protocol model.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while interpreting protocol payloads.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A bloom filter's parameters are inconsistent.
    #[error("invalid bloom filter: {0}")]
    InvalidBloomFilter(String),
}

impl ProtocolError {
    /// Creates an invalid bloom filter error.
    pub fn invalid_bloom_filter(message: impl Into<String>) -> Self {
        Self::InvalidBloomFilter(message.into())
    }
}
