//! Single-document mutations.

use super::transform::{FieldTransform, Precondition, TransformOperation};
use crate::error::{CoreError, CoreResult};
use crate::model::{DocumentKey, FieldMask, FieldPath, MutableDocument, ObjectValue, SnapshotVersion};
use docsync_codec::{Timestamp, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// The write a mutation performs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MutationKind {
    /// Replace the whole document.
    Set {
        /// New document contents.
        value: ObjectValue,
    },
    /// Overwrite only the fields in `mask`. Fields in the mask that are
    /// absent from `value` are deleted.
    Patch {
        /// Values for the masked fields.
        value: ObjectValue,
        /// Fields the patch touches.
        mask: FieldMask,
    },
    /// Delete the document.
    Delete,
    /// Check the precondition without writing. Only used in transactions.
    Verify,
}

/// A write to one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    key: DocumentKey,
    kind: MutationKind,
    precondition: Precondition,
    field_transforms: Vec<FieldTransform>,
}

/// The backend's answer to one mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationResult {
    /// Version the document has after the write.
    pub version: SnapshotVersion,
    /// Resolved values of the mutation's field transforms, in order.
    pub transform_results: Vec<Value>,
}

impl MutationResult {
    /// Creates a result without transform values.
    pub fn new(version: SnapshotVersion) -> Self {
        Self {
            version,
            transform_results: Vec::new(),
        }
    }

    /// Attaches transform values.
    #[must_use]
    pub fn with_transform_results(mut self, results: Vec<Value>) -> Self {
        self.transform_results = results;
        self
    }
}

impl Mutation {
    fn new(key: DocumentKey, kind: MutationKind) -> Self {
        Self {
            key,
            kind,
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        }
    }

    /// Creates a mutation that replaces the document.
    pub fn set(key: DocumentKey, value: ObjectValue) -> Self {
        Self::new(key, MutationKind::Set { value })
    }

    /// Creates a mutation that overwrites the masked fields.
    pub fn patch(key: DocumentKey, value: ObjectValue, mask: FieldMask) -> Self {
        Self::new(key, MutationKind::Patch { value, mask })
    }

    /// Creates a mutation that deletes the document.
    pub fn delete(key: DocumentKey) -> Self {
        Self::new(key, MutationKind::Delete)
    }

    /// Creates a mutation that asserts the document's version.
    pub fn verify(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self::new(key, MutationKind::Verify).with_precondition(if version.is_none() {
            Precondition::Exists(false)
        } else {
            Precondition::UpdateTime(version)
        })
    }

    /// Sets the precondition.
    #[must_use]
    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        self.precondition = precondition;
        self
    }

    /// Adds a field transform.
    #[must_use]
    pub fn with_transform(mut self, field: FieldPath, operation: TransformOperation) -> Self {
        self.field_transforms.push(FieldTransform::new(field, operation));
        self
    }

    /// Returns the target document.
    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    /// Returns the write kind.
    pub fn kind(&self) -> &MutationKind {
        &self.kind
    }

    /// Returns the precondition.
    pub fn precondition(&self) -> &Precondition {
        &self.precondition
    }

    /// Returns the field transforms.
    pub fn field_transforms(&self) -> &[FieldTransform] {
        &self.field_transforms
    }

    /// Returns true for verify mutations.
    pub fn is_verify(&self) -> bool {
        matches!(self.kind, MutationKind::Verify)
    }

    /// Returns the patch mask. Sets and deletes touch the whole document and
    /// return `None`.
    pub fn field_mask(&self) -> Option<&FieldMask> {
        match &self.kind {
            MutationKind::Patch { mask, .. } => Some(mask),
            _ => None,
        }
    }

    /// Checks the mutation for problems that make it impossible to apply.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an update-time precondition without a
    /// version, for a field transformed twice, or for a transform on a field
    /// that the patch also writes.
    pub fn validate(&self) -> CoreResult<()> {
        if let Precondition::UpdateTime(version) = self.precondition {
            if version.is_none() {
                return Err(CoreError::validation(format!(
                    "update-time precondition on {} has no version",
                    self.key
                )));
            }
        }
        let mut seen = BTreeSet::new();
        for transform in &self.field_transforms {
            if !seen.insert(&transform.field) {
                return Err(CoreError::validation(format!(
                    "field {} of {} is transformed more than once",
                    transform.field, self.key
                )));
            }
            if let MutationKind::Patch { value, .. } = &self.kind {
                if value.field(&transform.field).is_some() {
                    return Err(CoreError::validation(format!(
                        "field {} of {} is both written and transformed",
                        transform.field, self.key
                    )));
                }
            }
        }
        Ok(())
    }

    /// Applies the mutation to a local view of `doc`.
    ///
    /// `previous_mask` is the set of fields changed by earlier mutations, or
    /// `None` when an earlier mutation replaced the whole document. Returns
    /// the updated mask in the same form.
    pub fn apply_to_local_view(
        &self,
        doc: &mut MutableDocument,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        if !self.precondition.is_valid_for(doc) {
            return previous_mask;
        }
        match &self.kind {
            MutationKind::Set { value } => {
                let transform_results = self.local_transform_results(doc, local_write_time);
                let mut data = value.clone();
                data.set_all(transform_results);
                let version = doc.version();
                doc.convert_to_found(version, data).set_has_local_mutations();
                None
            }
            MutationKind::Patch { value, mask } => {
                let transform_results = self.local_transform_results(doc, local_write_time);
                let mut data = doc.data().cloned().unwrap_or_default();
                data.set_all(patch_writes(value, mask));
                data.set_all(transform_results);
                let version = doc.version();
                doc.convert_to_found(version, data).set_has_local_mutations();
                previous_mask.map(|previous| {
                    let mut merged = previous.union(mask);
                    for transform in &self.field_transforms {
                        merged.insert(transform.field.clone());
                    }
                    merged
                })
            }
            MutationKind::Delete => {
                let version = doc.version();
                doc.convert_to_no_document(version).set_has_local_mutations();
                None
            }
            MutationKind::Verify => previous_mask,
        }
    }

    /// Applies the acknowledged mutation to the cached remote document.
    ///
    /// # Errors
    ///
    /// Returns a fatal error if the backend returned the wrong number of
    /// transform results, or for verify mutations, which never reach the
    /// mutation queue.
    pub fn apply_to_remote_document(
        &self,
        doc: &mut MutableDocument,
        result: &MutationResult,
    ) -> CoreResult<()> {
        match &self.kind {
            MutationKind::Set { value } => {
                let transform_results = self.server_transform_results(doc, result)?;
                let mut data = value.clone();
                data.set_all(transform_results);
                doc.convert_to_found(result.version, data)
                    .set_has_committed_mutations();
            }
            MutationKind::Patch { value, mask } => {
                if !self.precondition.is_valid_for(doc) {
                    doc.convert_to_unknown(result.version);
                    return Ok(());
                }
                let transform_results = self.server_transform_results(doc, result)?;
                let mut data = doc.data().cloned().unwrap_or_default();
                data.set_all(patch_writes(value, mask));
                data.set_all(transform_results);
                doc.convert_to_found(result.version, data)
                    .set_has_committed_mutations();
            }
            MutationKind::Delete => {
                doc.convert_to_no_document(result.version)
                    .set_has_committed_mutations();
            }
            MutationKind::Verify => {
                return Err(CoreError::fatal(format!(
                    "verify mutation for {} reached the mutation queue",
                    self.key
                )));
            }
        }
        Ok(())
    }

    fn local_transform_results(
        &self,
        doc: &MutableDocument,
        local_write_time: Timestamp,
    ) -> BTreeMap<FieldPath, Option<Value>> {
        self.field_transforms
            .iter()
            .map(|t| {
                let previous = doc.field(&t.field);
                (
                    t.field.clone(),
                    Some(t.operation.apply_to_local_view(previous, local_write_time)),
                )
            })
            .collect()
    }

    fn server_transform_results(
        &self,
        doc: &MutableDocument,
        result: &MutationResult,
    ) -> CoreResult<BTreeMap<FieldPath, Option<Value>>> {
        if self.field_transforms.is_empty() {
            return Ok(BTreeMap::new());
        }
        if self.field_transforms.len() != result.transform_results.len() {
            return Err(CoreError::fatal(format!(
                "expected {} transform results for {}, got {}",
                self.field_transforms.len(),
                self.key,
                result.transform_results.len()
            )));
        }
        Ok(self
            .field_transforms
            .iter()
            .zip(&result.transform_results)
            .map(|(t, server)| {
                let previous = doc.field(&t.field);
                (
                    t.field.clone(),
                    Some(t.operation.apply_to_remote_document(previous, server.clone())),
                )
            })
            .collect())
    }
}

fn patch_writes(value: &ObjectValue, mask: &FieldMask) -> BTreeMap<FieldPath, Option<Value>> {
    mask.fields()
        .map(|path| (path.clone(), value.field(path).cloned()))
        .collect()
}

/// Condenses the local changes of `doc` into a single mutation.
///
/// `mask` is the result of applying every pending mutation with
/// [`Mutation::apply_to_local_view`], starting from an empty mask. Returns
/// `None` when the document has no local changes.
pub fn calculate_overlay_mutation(doc: &MutableDocument, mask: Option<&FieldMask>) -> Option<Mutation> {
    if !doc.has_local_mutations() {
        return None;
    }
    let Some(mask) = mask else {
        return Some(match doc.data() {
            Some(data) => Mutation::set(doc.key().clone(), data.clone()),
            None => Mutation::delete(doc.key().clone()),
        });
    };
    if mask.is_empty() {
        return None;
    }

    let data = doc.data().cloned().unwrap_or_default();
    let mut patch = ObjectValue::empty();
    let mut overlay_mask = FieldMask::empty();
    for path in mask.fields() {
        if overlay_mask.fields().any(|p| p == path) {
            continue;
        }
        let mut path = path.clone();
        let mut value = data.field(&path);
        // A deleted nested field is expressed through its parent.
        if value.is_none() {
            if let Some(parent) = path.parent() {
                value = data.field(&parent);
                path = parent;
            }
        }
        match value {
            Some(value) => patch.set(&path, value.clone()),
            None => patch.delete(&path),
        }
        overlay_mask.insert(path);
    }
    Some(Mutation::patch(doc.key().clone(), patch, overlay_mask))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::parse(path).unwrap()
    }

    fn field(path: &str) -> FieldPath {
        FieldPath::parse(path).unwrap()
    }

    fn found(path: &str, pairs: Vec<(&str, Value)>) -> MutableDocument {
        MutableDocument::new_found(
            key(path),
            SnapshotVersion::from_micros(1),
            ObjectValue::from_pairs(pairs),
        )
    }

    #[test]
    fn set_replaces_contents() {
        let mut doc = found("users/1", vec![("a", Value::Integer(1))]);
        let set = Mutation::set(key("users/1"), ObjectValue::from_pairs([("b", Value::Integer(2))]));
        let mask = set.apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::MIN);
        assert!(mask.is_none());
        assert!(doc.has_local_mutations());
        assert_eq!(doc.field(&field("a")), None);
        assert_eq!(doc.field(&field("b")), Some(&Value::Integer(2)));
        assert_eq!(doc.version(), SnapshotVersion::from_micros(1));
    }

    #[test]
    fn patch_merges_and_deletes_masked_fields() {
        let mut doc = found("users/1", vec![("a", Value::Integer(1)), ("b", Value::Integer(2))]);
        let patch = Mutation::patch(
            key("users/1"),
            ObjectValue::from_pairs([("a", Value::Integer(10))]),
            [field("a"), field("b")].into_iter().collect(),
        );
        let mask = patch
            .apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::MIN)
            .unwrap();
        assert_eq!(mask.len(), 2);
        assert_eq!(doc.field(&field("a")), Some(&Value::Integer(10)));
        assert_eq!(doc.field(&field("b")), None);
    }

    #[test]
    fn failed_precondition_leaves_document() {
        let mut doc = MutableDocument::new_invalid(key("users/1"));
        let patch = Mutation::patch(
            key("users/1"),
            ObjectValue::from_pairs([("a", Value::Integer(1))]),
            [field("a")].into_iter().collect(),
        )
        .with_precondition(Precondition::Exists(true));
        let mask = patch.apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::MIN);
        assert_eq!(mask, Some(FieldMask::empty()));
        assert!(!doc.is_valid_document());
    }

    #[test]
    fn delete_then_set_overlay_is_a_set() {
        let mut doc = found("users/1", vec![("a", Value::Integer(1))]);
        let mut mask = Some(FieldMask::empty());
        mask = Mutation::delete(key("users/1")).apply_to_local_view(&mut doc, mask, Timestamp::MIN);
        mask = Mutation::set(key("users/1"), ObjectValue::from_pairs([("b", Value::Integer(1))]))
            .apply_to_local_view(&mut doc, mask, Timestamp::MIN);
        let overlay = calculate_overlay_mutation(&doc, mask.as_ref()).unwrap();
        assert!(matches!(overlay.kind(), MutationKind::Set { .. }));
    }

    #[test]
    fn delete_overlay() {
        let mut doc = found("users/1", vec![("a", Value::Integer(1))]);
        let mask = Mutation::delete(key("users/1")).apply_to_local_view(
            &mut doc,
            Some(FieldMask::empty()),
            Timestamp::MIN,
        );
        let overlay = calculate_overlay_mutation(&doc, mask.as_ref()).unwrap();
        assert_eq!(overlay.kind(), &MutationKind::Delete);
    }

    #[test]
    fn transform_results_from_server() {
        let mut doc = found("users/1", vec![("count", Value::Integer(1))]);
        let patch = Mutation::patch(key("users/1"), ObjectValue::empty(), FieldMask::empty())
            .with_transform(field("count"), TransformOperation::NumericIncrement(Value::Integer(1)));
        let result = MutationResult::new(SnapshotVersion::from_micros(5))
            .with_transform_results(vec![Value::Integer(42)]);
        patch.apply_to_remote_document(&mut doc, &result).unwrap();
        assert_eq!(doc.field(&field("count")), Some(&Value::Integer(42)));
        assert!(doc.has_committed_mutations());
        assert_eq!(doc.version(), SnapshotVersion::from_micros(5));

        let wrong = MutationResult::new(SnapshotVersion::from_micros(6));
        assert!(patch.apply_to_remote_document(&mut doc, &wrong).unwrap_err().is_fatal());
    }

    #[test]
    fn patch_on_missing_document_becomes_unknown() {
        let mut doc = MutableDocument::new_no_document(key("users/1"), SnapshotVersion::from_micros(1));
        let patch = Mutation::patch(
            key("users/1"),
            ObjectValue::from_pairs([("a", Value::Integer(1))]),
            [field("a")].into_iter().collect(),
        )
        .with_precondition(Precondition::Exists(true));
        patch
            .apply_to_remote_document(&mut doc, &MutationResult::new(SnapshotVersion::from_micros(2)))
            .unwrap();
        assert!(doc.is_unknown_document());
    }

    #[test]
    fn validation_rules() {
        let bad = Mutation::delete(key("users/1"))
            .with_precondition(Precondition::UpdateTime(SnapshotVersion::NONE));
        assert!(bad.validate().unwrap_err().is_validation());

        let twice = Mutation::patch(key("users/1"), ObjectValue::empty(), FieldMask::empty())
            .with_transform(field("a"), TransformOperation::ServerTimestamp)
            .with_transform(field("a"), TransformOperation::ServerTimestamp);
        assert!(twice.validate().is_err());
    }
}
