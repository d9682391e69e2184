//! Overlays: the net pending change of one document.

use super::write::Mutation;
use crate::model::{BatchId, DocumentKey, FieldMask, MutableDocument};
use serde::{Deserialize, Serialize};

/// The condensed effect of every queued mutation touching one document.
///
/// Overlays are a cache derived from the mutation queue; they can always be
/// recomputed from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Overlay {
    /// Highest batch id folded into this overlay.
    pub largest_batch_id: BatchId,
    /// The synthesized mutation.
    pub mutation: Mutation,
}

impl Overlay {
    /// Creates an overlay.
    pub fn new(largest_batch_id: BatchId, mutation: Mutation) -> Self {
        Self {
            largest_batch_id,
            mutation,
        }
    }

    /// Returns the document the overlay applies to.
    pub fn key(&self) -> &DocumentKey {
        self.mutation.key()
    }
}

/// A document with its overlay applied, plus the fields the overlay
/// changed (`None` when the overlay replaced the whole document).
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayedDocument {
    /// The local view of the document.
    pub document: MutableDocument,
    /// Fields changed by pending writes.
    pub mutated_fields: Option<FieldMask>,
}

impl OverlayedDocument {
    /// Creates an overlaid document.
    pub fn new(document: MutableDocument, mutated_fields: Option<FieldMask>) -> Self {
        Self {
            document,
            mutated_fields,
        }
    }
}
