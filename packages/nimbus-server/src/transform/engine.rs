//! Bulk/single jq and JSON-Patch mutation over one key or a prefix (§4.G).

use std::sync::Arc;
use std::time::Duration;

use nimbus_core::{EngineError, EngineResult, Value};
use serde::{Deserialize, Serialize};

use crate::storage::batch::Batch;
use crate::storage::engine::IterationCursor;
use crate::storage::store::{Store, WriteOptions};

use super::{jq, patch};

#[derive(Debug, Clone, Default)]
pub struct TransformOptions {
    /// Treat each value as an opaque string rather than parsing it as JSON.
    pub treat_as_string: bool,
    /// If false, the first per-entry failure aborts the run.
    pub ignore_errors: bool,
    /// Compute results without writing them back.
    pub dry_run: bool,
    /// Overall wall-clock budget; zero means no timeout.
    pub timeout_ms: u64,
    /// Entries per atomically-committed batch.
    pub batch_size: usize,
    /// Treat the target as a prefix scan rather than a single key.
    pub prefix: bool,
}

impl TransformOptions {
    #[must_use]
    pub fn single_key() -> Self {
        Self { batch_size: 1, ignore_errors: true, ..Default::default() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntryResult {
    pub key: String,
    pub original_value: Option<Value>,
    pub new_value: Option<Value>,
    pub error: Option<String>,
    pub skipped: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TransformSummary {
    pub total_processed: usize,
    pub successful: usize,
    pub errors: usize,
    pub skipped: usize,
    pub results: Vec<EntryResult>,
}

pub struct TransformEngine {
    store: Arc<Store>,
}

impl TransformEngine {
    #[must_use]
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub async fn transform_with_jq(&self, target: &str, expression: &str, options: TransformOptions) -> EngineResult<TransformSummary> {
        let expression = expression.to_string();
        self.run(target, options, move |value| jq::eval_first(&expression, value)).await
    }

    pub async fn transform_with_patch(&self, target: &str, ops: serde_json::Value, options: TransformOptions) -> EngineResult<TransformSummary> {
        self.run(target, options, move |value| patch::apply_patch(value, &ops).map(Some)).await
    }

    /// Read-only jq evaluation over a single key or a prefix, without any
    /// write-back. Used by the query endpoints: unlike `transform_with_jq`,
    /// the jq expression runs once per matching entry and the per-entry
    /// outputs are the caller's answer, not a side effect.
    pub async fn query_with_jq(&self, target: &str, expression: &str, prefix: bool, limit: Option<usize>) -> EngineResult<TransformSummary> {
        let options = TransformOptions { prefix, dry_run: true, ignore_errors: true, batch_size: 1, ..Default::default() };
        let mut summary = self.transform_with_jq(target, expression, options).await?;
        if let Some(limit) = limit {
            summary.results.truncate(limit);
        }
        Ok(summary)
    }

    /// Collects every value under `prefix` into a single JSON array and
    /// evaluates `expression` against it once, for cross-entry reductions
    /// (`add`, `group_by`, `length`, ...) that a per-entry query can't
    /// express.
    pub async fn aggregate_with_jq(&self, prefix: &str, expression: &str, limit: Option<usize>) -> EngineResult<Option<Value>> {
        let store = Arc::clone(&self.store);
        let prefix = prefix.to_string();
        let mut keys = collect_prefix_keys(&store, &prefix);
        if let Some(limit) = limit {
            keys.truncate(limit);
        }
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(store.get(&key)?.to_json());
        }
        jq::eval_first(expression, &Value::from_json(serde_json::Value::Array(values)))
    }

    /// Runs an arbitrary per-entry transformation. `transform_with_jq` and
    /// `transform_with_patch` are both thin bindings of specific
    /// transformers onto this shared batching/error-policy machinery.
    async fn run<F>(&self, target: &str, options: TransformOptions, transform: F) -> EngineResult<TransformSummary>
    where
        F: Fn(&Value) -> EngineResult<Option<Value>> + Send + Sync + 'static,
    {
        let store = Arc::clone(&self.store);
        let target = target.to_string();
        let timeout_ms = options.timeout_ms;
        let body = async move { Self::run_inner(&store, &target, &options, &transform) };

        if timeout_ms == 0 {
            Ok(body.await)
        } else {
            tokio::time::timeout(Duration::from_millis(timeout_ms), body)
                .await
                .map_err(|_| EngineError::Timeout { elapsed_ms: timeout_ms })
        }
    }

    fn run_inner<F>(store: &Store, target: &str, options: &TransformOptions, transform: &F) -> TransformSummary
    where
        F: Fn(&Value) -> EngineResult<Option<Value>>,
    {
        let mut summary = TransformSummary::default();
        let batch_size = options.batch_size.max(1);
        let mut pending = store.batch();
        let mut pending_keys: Vec<String> = Vec::new();

        let keys: Vec<String> = if options.prefix {
            collect_prefix_keys(store, target)
        } else {
            vec![target.to_string()]
        };

        for key in keys {
            summary.total_processed += 1;
            let original = match store.get(&key) {
                Ok(v) => v,
                Err(err) => {
                    summary.results.push(EntryResult {
                        key: key.clone(),
                        original_value: None,
                        new_value: None,
                        error: Some(err.to_string()),
                        skipped: false,
                    });
                    summary.errors += 1;
                    if !options.ignore_errors {
                        break;
                    }
                    continue;
                }
            };

            let parsed = if options.treat_as_string {
                Value::String(original.to_json().to_string())
            } else {
                original.clone()
            };

            match transform(&parsed) {
                Ok(None) | Ok(Some(Value::Null)) => {
                    summary.skipped += 1;
                    summary.results.push(EntryResult {
                        key,
                        original_value: Some(original),
                        new_value: None,
                        error: None,
                        skipped: true,
                    });
                }
                Ok(Some(new_value)) => {
                    summary.successful += 1;
                    if !options.dry_run {
                        pending = pending.put(key.clone(), &new_value);
                        pending_keys.push(key.clone());
                        if pending_keys.len() >= batch_size {
                            pending = Self::flush(store, pending, &mut pending_keys, &mut summary);
                        }
                    }
                    summary.results.push(EntryResult {
                        key,
                        original_value: Some(original),
                        new_value: Some(new_value),
                        error: None,
                        skipped: false,
                    });
                }
                Err(err) => {
                    summary.errors += 1;
                    summary.results.push(EntryResult {
                        key,
                        original_value: Some(original),
                        new_value: None,
                        error: Some(err.to_string()),
                        skipped: false,
                    });
                    if !options.ignore_errors {
                        break;
                    }
                }
            }
        }

        if !pending_keys.is_empty() {
            let _ = Self::flush(store, pending, &mut pending_keys, &mut summary);
        }

        summary
    }

    fn flush(store: &Store, pending: Batch, pending_keys: &mut Vec<String>, summary: &mut TransformSummary) -> Batch {
        if let Err(err) = store.commit_batch(pending, WriteOptions::default()) {
            for key in pending_keys.iter() {
                if let Some(result) = summary.results.iter_mut().rev().find(|r| &r.key == key && r.error.is_none()) {
                    result.error = Some(err.to_string());
                    summary.successful -= 1;
                    summary.errors += 1;
                }
            }
        }
        pending_keys.clear();
        store.batch()
    }
}

fn collect_prefix_keys(store: &Store, prefix: &str) -> Vec<String> {
    let mut cursor = IterationCursor::start();
    let mut out = Vec::new();
    loop {
        let Ok(page) = store.iterate(prefix, &cursor, 256) else { break };
        out.extend(page.items.into_iter().map(|(k, _)| k));
        if page.next_cursor.finished {
            break;
        }
        cursor = page.next_cursor;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::bus::EventBus;
    use crate::storage::kv_redb::RedbEngine;
    use std::sync::Arc;

    fn store() -> Arc<Store> {
        let engine: Arc<dyn crate::storage::StorageEngine> = Arc::new(RedbEngine::in_memory().unwrap());
        Arc::new(Store::new(engine, Arc::new(EventBus::new())))
    }

    #[tokio::test]
    async fn jq_transform_writes_computed_total() {
        let store = store();
        store.put("/o/1", &Value::from_json(serde_json::json!({"price": 2, "qty": 3}))).unwrap();

        let te = TransformEngine::new(Arc::clone(&store));
        let options = TransformOptions { prefix: false, ignore_errors: true, batch_size: 10, ..Default::default() };
        let summary = te.transform_with_jq("/o/1", ".total = .price * .qty", options).await.unwrap();

        assert_eq!(summary.successful, 1);
        let stored = store.get("/o/1").unwrap();
        assert_eq!(stored.to_json()["total"], serde_json::json!(6));
    }

    #[tokio::test]
    async fn dry_run_does_not_write() {
        let store = store();
        store.put("/o/1", &Value::from_json(serde_json::json!({"a": 1}))).unwrap();

        let te = TransformEngine::new(Arc::clone(&store));
        let options = TransformOptions { dry_run: true, batch_size: 10, ignore_errors: true, ..Default::default() };
        te.transform_with_jq("/o/1", ".a = 2", options).await.unwrap();

        let stored = store.get("/o/1").unwrap();
        assert_eq!(stored.to_json()["a"], serde_json::json!(1));
    }

    #[tokio::test]
    async fn null_output_is_skipped() {
        let store = store();
        store.put("/o/1", &Value::from_json(serde_json::json!({"a": 1}))).unwrap();

        let te = TransformEngine::new(Arc::clone(&store));
        let options = TransformOptions { batch_size: 10, ignore_errors: true, ..Default::default() };
        let summary = te.transform_with_jq("/o/1", "null", options).await.unwrap();

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.successful, 0);
    }

    #[tokio::test]
    async fn patch_applies_over_prefix() {
        let store = store();
        store.put("/p/1", &Value::from_json(serde_json::json!({"n": 1}))).unwrap();
        store.put("/p/2", &Value::from_json(serde_json::json!({"n": 2}))).unwrap();

        let te = TransformEngine::new(Arc::clone(&store));
        let ops = serde_json::json!([{"op": "add", "path": "/tag", "value": "x"}]);
        let options = TransformOptions { prefix: true, batch_size: 1, ignore_errors: true, ..Default::default() };
        let summary = te.transform_with_patch("/p/", ops, options).await.unwrap();

        assert_eq!(summary.successful, 2);
        assert_eq!(store.get("/p/1").unwrap().to_json()["tag"], serde_json::json!("x"));
    }

    #[tokio::test]
    async fn query_with_jq_does_not_write_back() {
        let store = store();
        store.put("/o/1", &Value::from_json(serde_json::json!({"price": 2, "qty": 3}))).unwrap();

        let te = TransformEngine::new(Arc::clone(&store));
        let summary = te.query_with_jq("/o/1", ".price * .qty", false, None).await.unwrap();

        assert_eq!(summary.results[0].new_value, Some(Value::Int(6)));
        assert_eq!(store.get("/o/1").unwrap().to_json()["total"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn aggregate_with_jq_reduces_across_the_prefix() {
        let store = store();
        store.put("/o/1", &Value::from_json(serde_json::json!({"price": 2}))).unwrap();
        store.put("/o/2", &Value::from_json(serde_json::json!({"price": 5}))).unwrap();

        let te = TransformEngine::new(Arc::clone(&store));
        let result = te.aggregate_with_jq("/o/", "[.[] | .price] | add", None).await.unwrap();

        assert_eq!(result, Some(Value::Int(7)));
    }
}
