//! The local store and the caches behind it.

mod index_manager;
mod local_documents_view;
mod local_store;
mod mutation_queue;
mod overlay_cache;
mod persistence;
mod query_engine;
mod reference_set;
mod remote_document_cache;
mod schema;
mod target_cache;
mod target_data;

pub use index_manager::FieldIndex;
pub use local_store::{LocalStore, LocalViewChanges, LocalWriteResult, QueryResult};
pub use persistence::Persistence;
pub use query_engine::{QueryEngine, QueryStrategy};
pub use reference_set::ReferenceSet;
pub use target_cache::TargetIdGenerator;
pub use target_data::{TargetData, TargetPurpose};
