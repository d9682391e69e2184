//! # docsync Sync Protocol
//!
//! Client-side model of the docsync backend protocol.
//!
//! This crate provides:
//! - [`Status`] and [`Code`] for stream and RPC failures, with the
//!   permanent/transient classification the engine retries on
//! - [`WatchChange`] and its variants, as delivered on the listen stream
//! - Listen and write stream requests and responses
//! - [`BloomFilter`] for existence-filter reconciliation
//!
//! This is a pure protocol crate with no I/O operations. How messages are
//! framed on the wire is up to the transport.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod bloom_filter;
mod error;
mod messages;
mod status;
mod watch;

pub use bloom_filter::{BloomFilter, BloomFilterParams};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    ListenRequest, StreamKind, StreamRequest, StreamResponse, TargetRequest, WriteRequest,
    WriteResponse,
};
pub use status::{Code, Status};
pub use watch::{
    DocumentChange, ExistenceFilter, ExistenceFilterChange, WatchChange, WatchTargetChange,
    WatchTargetChangeState,
};
