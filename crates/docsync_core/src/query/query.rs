//! Structured queries.

use super::filter::{FieldFilter, Operator};
use super::order::{Bound, Direction, OrderBy};
use super::target::Target;
use crate::collections::Comparator;
use crate::error::CoreResult;
use crate::model::{DocumentKey, FieldPath, MutableDocument, ResourcePath};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Whether a limit keeps the first or the last results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum LimitType {
    /// Keep the first N results.
    #[default]
    First,
    /// Keep the last N results.
    Last,
}

/// An application-level query over one collection or one document.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    path: ResourcePath,
    filters: Vec<FieldFilter>,
    explicit_order_by: Vec<OrderBy>,
    limit: Option<u32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    /// Creates a query over the documents at `path`.
    pub fn at_path(path: ResourcePath) -> Self {
        Self {
            path,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    /// Creates a query over a collection given as a slash-separated path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path cannot be parsed.
    pub fn collection(path: &str) -> CoreResult<Self> {
        Ok(Self::at_path(ResourcePath::parse(path)?))
    }

    /// Creates a query for a single document.
    pub fn document(key: &DocumentKey) -> Self {
        Self::at_path(key.path().clone())
    }

    /// Adds a filter.
    #[must_use]
    pub fn with_filter(mut self, filter: FieldFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Adds a sort key.
    #[must_use]
    pub fn with_order_by(mut self, order_by: OrderBy) -> Self {
        self.explicit_order_by.push(order_by);
        self
    }

    /// Keeps only the first `limit` results.
    #[must_use]
    pub fn with_limit_to_first(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        self
    }

    /// Keeps only the last `limit` results.
    #[must_use]
    pub fn with_limit_to_last(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        self
    }

    /// Sets the start cursor.
    #[must_use]
    pub fn starting_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    /// Sets the end cursor.
    #[must_use]
    pub fn ending_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    /// Returns the queried path.
    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    /// Returns the filters.
    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    /// Returns the user-specified sort keys.
    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    /// Returns the limit.
    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    /// Returns the limit type.
    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    /// Returns true if a "first N" limit is set.
    pub fn has_limit_to_first(&self) -> bool {
        self.limit.is_some() && self.limit_type == LimitType::First
    }

    /// Returns true if a "last N" limit is set.
    pub fn has_limit_to_last(&self) -> bool {
        self.limit.is_some() && self.limit_type == LimitType::Last
    }

    /// Returns true if the query targets exactly one document.
    pub fn is_document_query(&self) -> bool {
        self.path.is_document_path() && self.filters.is_empty()
    }

    /// Returns true if every document of the collection matches.
    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_by.is_empty()
                || (self.explicit_order_by.len() == 1
                    && self.explicit_order_by[0].field.is_key_field()))
    }

    fn inequality_fields(&self) -> BTreeSet<FieldPath> {
        self.filters
            .iter()
            .filter(|f| f.op.is_inequality())
            .map(|f| f.field.clone())
            .collect()
    }

    /// Returns the full sort order: explicit keys, then inequality fields,
    /// then the document key, all in the direction of the last explicit key.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut result = self.explicit_order_by.clone();
        let last_direction = self
            .explicit_order_by
            .last()
            .map_or(Direction::Ascending, |o| o.direction);
        for field in self.inequality_fields() {
            if !field.is_key_field() && !result.iter().any(|o| o.field == field) {
                result.push(OrderBy::new(field, last_direction));
            }
        }
        if !result.iter().any(|o| o.field.is_key_field()) {
            result.push(OrderBy::new(FieldPath::key_path(), last_direction));
        }
        result
    }

    /// Returns true if `doc` is in the query's result set, ignoring limits.
    pub fn matches(&self, doc: &MutableDocument) -> bool {
        if !doc.is_found_document() {
            return false;
        }
        let in_path = if self.path.is_document_path() {
            doc.key().path() == &self.path
        } else {
            doc.key().has_collection(&self.path)
        };
        if !in_path {
            return false;
        }
        let order_by = self.normalized_order_by();
        if order_by
            .iter()
            .any(|o| !o.field.is_key_field() && doc.field(&o.field).is_none())
        {
            return false;
        }
        if !self.filters.iter().all(|f| f.matches(doc)) {
            return false;
        }
        if let Some(bound) = &self.start_at {
            if !bound.sorts_before_document(&order_by, doc) {
                return false;
            }
        }
        if let Some(bound) = &self.end_at {
            if !bound.sorts_after_document(&order_by, doc) {
                return false;
            }
        }
        true
    }

    /// Returns the comparator for this query's result order.
    pub fn comparator(&self) -> DocumentComparator {
        DocumentComparator {
            order_by: Arc::new(self.normalized_order_by()),
        }
    }

    /// Converts the query into its backend target.
    pub fn to_target(&self) -> Target {
        let order_by = self.normalized_order_by();
        match self.limit_type {
            LimitType::First => Target {
                path: self.path.clone(),
                filters: self.filters.clone(),
                order_by,
                limit: self.limit,
                start_at: self.start_at.clone(),
                end_at: self.end_at.clone(),
            },
            LimitType::Last => Target {
                path: self.path.clone(),
                filters: self.filters.clone(),
                order_by: order_by
                    .into_iter()
                    .map(|o| OrderBy::new(o.field, o.direction.reversed()))
                    .collect(),
                limit: self.limit,
                start_at: self.end_at.clone(),
                end_at: self.start_at.clone(),
            },
        }
    }

    /// Returns a string that is equal for equal queries.
    pub fn canonical_id(&self) -> String {
        let lt = match self.limit_type {
            LimitType::First => "f",
            LimitType::Last => "l",
        };
        format!("{}|lt:{}", self.to_target().canonical_id(), lt)
    }
}

/// Orders documents by a query's normalized sort order.
#[derive(Debug, Clone)]
pub struct DocumentComparator {
    order_by: Arc<Vec<OrderBy>>,
}

impl DocumentComparator {
    /// Orders documents by key only.
    pub fn by_key() -> Self {
        Self {
            order_by: Arc::new(vec![OrderBy::asc(FieldPath::key_path())]),
        }
    }
}

impl Comparator<MutableDocument> for DocumentComparator {
    fn compare(&self, a: &MutableDocument, b: &MutableDocument) -> Ordering {
        for order in self.order_by.iter() {
            let ordering = order.compare(a, b);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

/// Convenience constructor for `field op value` filters.
///
/// # Errors
///
/// Returns an error if `field` is not a valid field path.
pub fn field_filter(
    field: &str,
    op: Operator,
    value: impl Into<docsync_codec::Value>,
) -> CoreResult<FieldFilter> {
    Ok(FieldFilter::new(FieldPath::parse(field)?, op, value))
}
