//! Ordered key-value storage.
//!
//! - [`engine`]: the [`engine::StorageEngine`] trait plus the shared
//!   `StoredEntry`/`IterationCursor`/`BatchOp` types every implementation
//!   and caller deals in.
//! - [`kv_redb`]: the `redb`-backed implementation, on-disk or in-memory.
//! - [`batch`]: atomic multi-key write accumulation on top of a
//!   [`engine::StorageEngine`].
//! - [`store`]: the `Value`-level façade (`Store`) that the rest of the
//!   server talks to -- JSON boundary conversion, system-key reservation,
//!   and event-bus publication live here, not in the engine trait.

pub mod batch;
pub mod engine;
pub mod kv_redb;
pub mod store;

pub use batch::Batch;
pub use engine::{BatchOp, FetchResult, IterationCursor, StorageEngine, StoredEntry};
pub use kv_redb::RedbEngine;
pub use store::Store;
