//! Low-level ordered key-value storage trait.
//!
//! [`StorageEngine`] is the durability layer the rest of the server is
//! built on: plain bytes in, plain bytes out, with TTL bookkeeping and
//! cursor-based prefix iteration. Everything above this layer (events,
//! views, transforms) deals in structured `Value`s; this layer never does.

use nimbus_core::EngineResult;

/// Opaque iteration cursor.
///
/// `state` holds the last key yielded (empty at the start of iteration).
/// Callers must treat it as opaque; [`IterationCursor::start`] is the one
/// cross-engine-safe way to begin iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationCursor {
    pub state: Vec<u8>,
    pub finished: bool,
}

impl IterationCursor {
    #[must_use]
    pub fn start() -> Self {
        Self { state: Vec::new(), finished: false }
    }
}

impl Default for IterationCursor {
    fn default() -> Self {
        Self::start()
    }
}

/// A page of results plus the cursor to resume from.
#[derive(Debug, Clone)]
pub struct FetchResult<T> {
    pub items: Vec<T>,
    pub next_cursor: IterationCursor,
}

/// A single stored value plus its optional absolute expiration instant
/// (milliseconds since epoch).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub value: Vec<u8>,
    pub expires_at: Option<u64>,
}

impl StoredEntry {
    #[must_use]
    pub fn new(value: Vec<u8>) -> Self {
        Self { value, expires_at: None }
    }

    #[must_use]
    pub fn with_ttl(value: Vec<u8>, expires_at: u64) -> Self {
        Self { value, expires_at: Some(expires_at) }
    }

    #[must_use]
    pub fn is_expired(&self, now_millis: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now_millis)
    }
}

/// One operation accumulated onto a [`super::batch::Batch`] before commit.
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put { key: String, entry: StoredEntry },
    Delete { key: String },
}

impl BatchOp {
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            BatchOp::Put { key, .. } | BatchOp::Delete { key } => key,
        }
    }
}

/// Durable ordered key-value storage.
///
/// Implementations must guarantee strict lexicographic iteration order and
/// atomic all-or-nothing application of `apply_batch`. Used as
/// `Arc<dyn StorageEngine>`.
pub trait StorageEngine: Send + Sync {
    fn get(&self, key: &str) -> EngineResult<Option<StoredEntry>>;
    fn put(&self, key: &str, entry: StoredEntry) -> EngineResult<Option<StoredEntry>>;
    fn delete(&self, key: &str) -> EngineResult<Option<StoredEntry>>;
    fn has(&self, key: &str) -> EngineResult<bool>;
    fn set_ttl(&self, key: &str, expires_at: Option<u64>) -> EngineResult<bool>;

    fn len(&self) -> EngineResult<usize>;
    fn is_empty(&self) -> EngineResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Clears all entries. If `keep_system` is true, leaves any key under
    /// `/_system/` untouched (spec boundary behavior: "`clear` leaves
    /// `/_system/` intact iff the caller did not opt into full wipe").
    fn clear(&self, keep_system: bool) -> EngineResult<u64>;

    fn fetch_keys(
        &self,
        prefix: &str,
        cursor: &IterationCursor,
        size: usize,
    ) -> EngineResult<FetchResult<String>>;

    fn fetch_entries(
        &self,
        prefix: &str,
        cursor: &IterationCursor,
        size: usize,
    ) -> EngineResult<FetchResult<(String, StoredEntry)>>;

    /// Keys with a live expiration, in ascending `expires_at` order, capped
    /// at `limit`. Drives the TTL monitor's bounded-per-tick scan.
    fn expiring_keys(&self, limit: usize) -> EngineResult<Vec<(String, u64)>>;

    /// Applies a batch of puts/deletes atomically. On success returns the
    /// set of affected keys in call order (used to build the `batch`
    /// event).
    fn apply_batch(&self, ops: &[BatchOp]) -> EngineResult<Vec<String>>;
}
