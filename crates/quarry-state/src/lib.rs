//! quarry-state: the resource graph and its embedded store.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for resource providers, inventories, traits, aggregates,
//! consumers, allocations and server groups.
//!
//! # Architecture
//!
//! Entity records are JSON-serialized into redb's `&[u8]` value columns.
//! Relationships are stored as edge tables with `{from}/{to}` composite keys
//! so that traversal is always a prefix scan.
//!
//! - [`storage`]: the two-read/two-write primitive interface over redb
//!   transactions.
//! - [`graph`]: typed traversal ([`Graph`]) and index-maintaining writes
//!   ([`GraphWriter`]).
//! - [`store`]: [`StateStore`], which is `Clone` + `Send` + `Sync` (backed
//!   by `Arc<Database>`) and can be shared across async tasks.

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

pub mod error;
pub mod graph;
pub mod storage;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use graph::{Graph, GraphWriter, SharingPartner};
pub use storage::{Snapshot, StorageRead, StorageWrite, WriteBatch};
pub use store::StateStore;
pub use types::*;
