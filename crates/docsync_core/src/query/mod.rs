//! Queries, targets and their matching rules.

mod filter;
#[allow(clippy::module_inception)]
mod query;
mod order;
mod target;

pub use filter::{FieldFilter, Operator};
pub use order::{Bound, Direction, OrderBy};
pub use query::{field_filter, DocumentComparator, LimitType, Query};
pub use target::Target;
