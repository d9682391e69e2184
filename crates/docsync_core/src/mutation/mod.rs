//! Mutations, batches and overlays.

mod batch;
mod overlay;
mod transform;
mod write;

pub use batch::{MutationBatch, MutationBatchResult};
pub use overlay::{Overlay, OverlayedDocument};
pub use transform::{FieldTransform, Precondition, TransformOperation};
pub use write::{calculate_overlay_mutation, Mutation, MutationKind, MutationResult};
