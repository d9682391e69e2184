//! Persisted key layout and record encoding.
//!
//! | Prefix | Record |
//! |--------|--------|
//! | `doc/<path>` | cached remote document |
//! | `mutation/<batch id>` | queued mutation batch |
//! | `overlay/<path>` | document overlay |
//! | `target/<target id>` | target metadata |
//! | `target_doc/<target id>/<path>` | target membership (empty value) |
//! | `index/<collection>/<fields>` | field index definition |
//! | `global/...` | counters and the write stream token |

use crate::error::{CoreError, CoreResult};
use crate::model::{BatchId, DocumentKey, TargetId};
use docsync_codec::{from_cbor, to_canonical_cbor};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub(crate) const DOC_PREFIX: &str = "doc/";
pub(crate) const MUTATION_PREFIX: &str = "mutation/";
pub(crate) const OVERLAY_PREFIX: &str = "overlay/";
pub(crate) const TARGET_PREFIX: &str = "target/";
pub(crate) const TARGET_DOC_PREFIX: &str = "target_doc/";
pub(crate) const INDEX_PREFIX: &str = "index/";
pub(crate) const HIGHEST_ACKED_BATCH_ID: &str = "global/highest_acked_batch_id";
pub(crate) const TARGET_GLOBALS: &str = "global/target_globals";
pub(crate) const STREAM_TOKEN: &str = "global/stream_token";

pub(crate) fn doc_key(key: &DocumentKey) -> Vec<u8> {
    format!("{DOC_PREFIX}{key}").into_bytes()
}

pub(crate) fn mutation_key(batch_id: BatchId) -> Vec<u8> {
    format!("{MUTATION_PREFIX}{batch_id:020}").into_bytes()
}

pub(crate) fn overlay_key(key: &DocumentKey) -> Vec<u8> {
    format!("{OVERLAY_PREFIX}{key}").into_bytes()
}

pub(crate) fn target_key(target_id: TargetId) -> Vec<u8> {
    format!("{TARGET_PREFIX}{target_id:010}").into_bytes()
}

pub(crate) fn target_doc_prefix(target_id: TargetId) -> Vec<u8> {
    format!("{TARGET_DOC_PREFIX}{target_id:010}/").into_bytes()
}

pub(crate) fn target_doc_key(target_id: TargetId, key: &DocumentKey) -> Vec<u8> {
    format!("{TARGET_DOC_PREFIX}{target_id:010}/{key}").into_bytes()
}

pub(crate) fn index_key(collection: &str, fields: &str) -> Vec<u8> {
    format!("{INDEX_PREFIX}{collection}/{fields}").into_bytes()
}

/// Parses the target id and document key out of a `target_doc/` key.
pub(crate) fn parse_target_doc_key(raw: &[u8]) -> CoreResult<(TargetId, DocumentKey)> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| CoreError::corrupted("target membership key is not UTF-8"))?;
    let rest = text
        .strip_prefix(TARGET_DOC_PREFIX)
        .ok_or_else(|| CoreError::corrupted(format!("unexpected key {text}")))?;
    let (id, path) = rest
        .split_once('/')
        .ok_or_else(|| CoreError::corrupted(format!("malformed key {text}")))?;
    let target_id = id
        .parse()
        .map_err(|_| CoreError::corrupted(format!("malformed target id in {text}")))?;
    let key = DocumentKey::parse(path).map_err(|e| CoreError::corrupted(e.to_string()))?;
    Ok((target_id, key))
}

pub(crate) fn encode<T: Serialize>(record: &T) -> CoreResult<Vec<u8>> {
    Ok(to_canonical_cbor(record)?)
}

pub(crate) fn decode<T: DeserializeOwned>(key: &[u8], bytes: &[u8]) -> CoreResult<T> {
    from_cbor(bytes).map_err(|e| {
        CoreError::corrupted(format!("{}: {e}", String::from_utf8_lossy(key)))
    })
}
