//! Accumulated multi-key writes committed atomically through a
//! [`StorageEngine`].

use nimbus_core::{EngineResult, Value};

use super::engine::{BatchOp, StorageEngine, StoredEntry};

/// Builder for a batch of puts/deletes. Nothing touches storage until
/// [`Batch::commit`] is called; the whole set is then applied through a
/// single [`StorageEngine::apply_batch`] call.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    ops: Vec<BatchOp>,
}

impl Batch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn put(mut self, key: impl Into<String>, value: &Value) -> Self {
        self.ops.push(BatchOp::Put { key: key.into(), entry: StoredEntry::new(value.to_json_bytes()) });
        self
    }

    #[must_use]
    pub fn put_with_ttl(mut self, key: impl Into<String>, value: &Value, expires_at: u64) -> Self {
        self.ops
            .push(BatchOp::Put { key: key.into(), entry: StoredEntry::with_ttl(value.to_json_bytes(), expires_at) });
        self
    }

    #[must_use]
    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.ops.push(BatchOp::Delete { key: key.into() });
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Applies every accumulated op atomically and returns the affected
    /// keys in call order (including duplicates, since a key touched twice
    /// in one batch is reported twice -- callers collapsing for an event
    /// payload should dedupe themselves).
    pub fn commit(self, engine: &dyn StorageEngine) -> EngineResult<Vec<String>> {
        engine.apply_batch(&self.ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv_redb::RedbEngine;

    #[test]
    fn empty_batch_commits_to_nothing() {
        let engine = RedbEngine::in_memory().unwrap();
        let affected = Batch::new().commit(&engine).unwrap();
        assert!(affected.is_empty());
    }

    #[test]
    fn batch_put_and_delete_apply_in_order() {
        let engine = RedbEngine::in_memory().unwrap();
        let affected = Batch::new()
            .put("/a", &Value::Int(1))
            .put("/b", &Value::Int(2))
            .delete("/a")
            .commit(&engine)
            .unwrap();
        assert_eq!(affected, vec!["/a", "/b", "/a"]);
        assert!(!engine.has("/a").unwrap());
        assert!(engine.has("/b").unwrap());
    }

    #[test]
    fn batch_with_ttl_sets_expiry() {
        let engine = RedbEngine::in_memory().unwrap();
        Batch::new().put_with_ttl("/k", &Value::Bool(true), 1).commit(&engine).unwrap();
        assert!(engine.get("/k").unwrap().is_none());
    }
}
