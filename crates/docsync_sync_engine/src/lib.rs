//! # docsync Sync Engine
//!
//! Client-side synchronization for docsync.
//!
//! This crate provides:
//! - A serialized [`AsyncQueue`] with named, fast-forwardable timers
//! - Persistent listen and write streams with [`ExponentialBackoff`]
//! - Online-state inference ([`OnlineState`])
//! - Watch change aggregation with existence filters and bloom filters
//! - Query views, limbo resolution and query listeners
//! - Optimistic [`Transaction`]s
//! - The application-facing [`DocumentStore`]
//!
//! ## Architecture
//!
//! All client state lives in one sync engine that only runs as jobs on the
//! async queue. Stream I/O happens in spawned tasks that report back
//! through the queue, so the engine never blocks on the network:
//!
//! 1. Local writes go to the local store first and are raised to
//!    listeners immediately
//! 2. The write stream sends batches in order and acknowledges them in
//!    order
//! 3. The listen stream delivers watch changes, which are aggregated into
//!    consistent remote events and applied to the local store
//! 4. Views recompute their results and listeners get new snapshots
//!
//! The backend transport is supplied through the [`Connection`] trait.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod async_queue;
mod backoff;
mod client;
mod config;
mod connection;
mod credentials;
mod document_set;
mod error;
mod event_manager;
mod online_state;
mod remote_store;
mod stream;
mod sync_engine;
mod transaction;
mod user_data;
mod view;
mod view_snapshot;
mod watch;

pub use async_queue::{AsyncQueue, DelayedOperation, TimerId};
pub use backoff::ExponentialBackoff;
pub use client::{
    DocumentSnapshot, DocumentStore, ListenerRegistration, SnapshotMetadata, SnapshotStream, Source, WriteBatch,
};
pub use config::{BackoffConfig, EngineConfig, OnlineStateConfig, StreamConfig};
pub use connection::{Connection, StreamChannel, StreamEvent};
pub use credentials::{CredentialsProvider, EmptyCredentialsProvider, StaticCredentialsProvider, Token};
pub use document_set::DocumentSet;
pub use error::{ErrorKind, SyncError, SyncResult};
pub use event_manager::{ListenOptions, ListenSource};
pub use online_state::{OnlineState, OnlineStateTracker};
pub use transaction::Transaction;
pub use user_data::{DocumentData, FieldValue, SetOptions};
pub use view_snapshot::{ChangeType, DocumentViewChange, ViewSnapshot};
