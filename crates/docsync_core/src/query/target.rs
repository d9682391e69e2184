//! Targets: the backend-facing form of a query.

use super::filter::FieldFilter;
use super::order::{Bound, OrderBy};
use crate::model::{FieldPath, ResourcePath};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// A query as registered with the backend.
///
/// Targets always carry their fully normalized sort order. A "last N" query
/// becomes a "first N" target in the opposite direction, so two queries that
/// fetch the same documents share one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// Collection or document path.
    pub path: ResourcePath,
    /// Conjunctive filters.
    pub filters: Vec<FieldFilter>,
    /// Normalized sort order.
    pub order_by: Vec<OrderBy>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Start cursor.
    pub start_at: Option<Bound>,
    /// End cursor.
    pub end_at: Option<Bound>,
}

impl Target {
    /// Returns true if the target watches exactly one document.
    pub fn is_document_query(&self) -> bool {
        self.path.is_document_path() && self.filters.is_empty()
    }

    /// Returns a string that is equal for equal targets.
    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if !self.filters.is_empty() {
            id.push_str("|f:");
            for filter in &self.filters {
                id.push_str(&filter.canonical_id());
            }
        }
        id.push_str("|ob:");
        for order in &self.order_by {
            id.push_str(&order.canonical_id());
        }
        if let Some(limit) = self.limit {
            let _ = write!(id, "|l:{limit}");
        }
        if let Some(bound) = &self.start_at {
            id.push_str("|lb:");
            id.push_str(&bound.canonical_id());
        }
        if let Some(bound) = &self.end_at {
            id.push_str("|ub:");
            id.push_str(&bound.canonical_id());
        }
        id
    }

    /// Returns the fields an index must cover to serve this target:
    /// equality fields in path order, then the remaining sort fields.
    pub fn index_fields(&self) -> Vec<FieldPath> {
        let mut equality: Vec<FieldPath> = self
            .filters
            .iter()
            .filter(|f| f.is_equality() && !f.field.is_key_field())
            .map(|f| f.field.clone())
            .collect();
        equality.sort();
        equality.dedup();
        let mut fields = equality;
        for order in &self.order_by {
            if !order.field.is_key_field() && !fields.contains(&order.field) {
                fields.push(order.field.clone());
            }
        }
        fields
    }
}
