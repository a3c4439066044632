//! The `Value`-level façade over a [`StorageEngine`].
//!
//! Everything above this module (HTTP gateway, script runtime, view engine)
//! talks to a `Store`, never to a `StorageEngine` directly: this is where
//! JSON boundary conversion, system-key protection, silent mode, and
//! event-bus publication live.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use nimbus_core::{EngineError, EngineResult, EventClock, Value};

use super::batch::Batch;
use super::engine::{FetchResult, IterationCursor, StorageEngine, StoredEntry};
use crate::events::bus::EventBus;
use crate::events::event::{Event, EventType};

pub const SYSTEM_PREFIX: &str = "/_system/";

/// Per-operation override of the process-wide silent-mode flag.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    pub silent: Option<bool>,
}

impl WriteOptions {
    #[must_use]
    pub fn silent() -> Self {
        Self { silent: Some(true) }
    }
}

pub struct Store {
    engine: Arc<dyn StorageEngine>,
    bus: Arc<EventBus>,
    clock: EventClock,
    silent_mode: AtomicBool,
}

impl Store {
    #[must_use]
    pub fn new(engine: Arc<dyn StorageEngine>, bus: Arc<EventBus>) -> Self {
        Self { engine, bus, clock: EventClock::system(), silent_mode: AtomicBool::new(false) }
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<dyn StorageEngine> {
        &self.engine
    }

    pub fn set_silent_mode(&self, silent: bool) {
        self.silent_mode.store(silent, Ordering::SeqCst);
    }

    #[must_use]
    pub fn silent_mode(&self) -> bool {
        self.silent_mode.load(Ordering::SeqCst)
    }

    fn emits(&self, opts: WriteOptions) -> bool {
        !opts.silent.unwrap_or_else(|| self.silent_mode())
    }

    pub fn get(&self, key: &str) -> EngineResult<Value> {
        let entry = self.engine.get(key)?.ok_or_else(|| EngineError::not_found(key))?;
        Value::from_json_bytes(&entry.value).ok_or_else(|| EngineError::internal("corrupt stored value"))
    }

    pub fn put(&self, key: &str, value: &Value) -> EngineResult<()> {
        self.put_opts(key, value, WriteOptions::default())
    }

    pub fn put_opts(&self, key: &str, value: &Value, opts: WriteOptions) -> EngineResult<()> {
        guard_system_key(key)?;
        self.engine.put(key, StoredEntry::new(value.to_json_bytes()))?;
        if self.emits(opts) {
            self.publish(EventType::Put, key, value);
        }
        Ok(())
    }

    pub fn put_with_ttl(&self, key: &str, value: &Value, ttl_millis: u64) -> EngineResult<()> {
        guard_system_key(key)?;
        if ttl_millis == 0 {
            return self.put(key, value);
        }
        let expires_at = self.clock.tick().millis.saturating_add(ttl_millis);
        self.engine.put(key, StoredEntry::with_ttl(value.to_json_bytes(), expires_at))?;
        if !self.silent_mode() {
            self.publish(EventType::Put, key, value);
        }
        Ok(())
    }

    pub fn set_ttl(&self, key: &str, ttl_millis: Option<u64>) -> EngineResult<bool> {
        guard_system_key(key)?;
        let expires_at = ttl_millis.map(|ttl| self.clock.tick().millis.saturating_add(ttl));
        self.engine.set_ttl(key, expires_at)
    }

    pub fn get_expiration(&self, key: &str) -> EngineResult<Option<u64>> {
        Ok(self.engine.get(key)?.and_then(|e| e.expires_at))
    }

    pub fn delete(&self, key: &str) -> EngineResult<bool> {
        self.delete_opts(key, WriteOptions::default())
    }

    pub fn delete_opts(&self, key: &str, opts: WriteOptions) -> EngineResult<bool> {
        guard_system_key(key)?;
        let removed = self.engine.delete(key)?;
        let Some(entry) = removed else { return Ok(false) };
        if self.emits(opts) {
            let value = Value::from_json_bytes(&entry.value).unwrap_or(Value::Null);
            self.publish(EventType::Delete, key, &value);
        }
        Ok(true)
    }

    pub fn has(&self, key: &str) -> EngineResult<bool> {
        self.engine.has(key)
    }

    pub fn get_size(&self, key: &str) -> EngineResult<usize> {
        Ok(self.engine.get(key)?.map(|e| e.value.len()).unwrap_or(0))
    }

    /// Clears all entries. `keep_system` preserves `/_system/*` -- callers
    /// not opting into a full wipe should pass `true`.
    pub fn clear(&self, keep_system: bool) -> EngineResult<u64> {
        self.engine.clear(keep_system)
    }

    pub fn keys(&self, prefix: &str, cursor: &IterationCursor, size: usize) -> EngineResult<FetchResult<String>> {
        self.engine.fetch_keys(prefix, cursor, size)
    }

    pub fn iterate(
        &self,
        prefix: &str,
        cursor: &IterationCursor,
        size: usize,
    ) -> EngineResult<FetchResult<(String, Value)>> {
        let page = self.engine.fetch_entries(prefix, cursor, size)?;
        let items = page
            .items
            .into_iter()
            .map(|(k, entry)| {
                let v = Value::from_json_bytes(&entry.value).unwrap_or(Value::Null);
                (k, v)
            })
            .collect();
        Ok(FetchResult { items, next_cursor: page.next_cursor })
    }

    #[must_use]
    pub fn batch(&self) -> Batch {
        Batch::new()
    }

    /// Commits a batch and, unless silent, publishes a single `batch`
    /// event carrying the affected keys.
    pub fn commit_batch(&self, batch: Batch, opts: WriteOptions) -> EngineResult<Vec<String>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let affected = batch.commit(self.engine.as_ref())?;
        if self.emits(opts) {
            let mut event = Event::new(EventType::Batch, String::new(), Value::Null, self.clock.tick());
            event.affected_keys = affected.clone();
            self.bus.publish(event);
        }
        Ok(affected)
    }

    fn publish(&self, kind: EventType, key: &str, value: &Value) {
        let event = Event::new(kind, key.to_string(), value.clone(), self.clock.tick());
        self.bus.publish(event);
    }
}

fn guard_system_key(key: &str) -> EngineResult<()> {
    if key.starts_with(SYSTEM_PREFIX) {
        return Err(EngineError::invalid(format!("{key} is reserved for engine state")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv_redb::RedbEngine;

    fn store() -> Store {
        let engine: Arc<dyn StorageEngine> = Arc::new(RedbEngine::in_memory().unwrap());
        Store::new(engine, Arc::new(EventBus::new()))
    }

    #[test]
    fn put_get_round_trip() {
        let s = store();
        s.put("/a", &Value::String("hi".into())).unwrap();
        assert_eq!(s.get("/a").unwrap(), Value::String("hi".into()));
    }

    #[test]
    fn missing_key_is_not_found() {
        let s = store();
        assert!(matches!(s.get("/missing").unwrap_err(), EngineError::NotFound { .. }));
    }

    #[test]
    fn writes_to_system_prefix_are_rejected() {
        let s = store();
        assert!(matches!(
            s.put("/_system/views/v1", &Value::Null).unwrap_err(),
            EngineError::Invalid { .. }
        ));
    }

    #[test]
    fn silent_mode_suppresses_events() {
        let s = store();
        let sub = s.bus.register_collecting();
        s.set_silent_mode(true);
        s.put("/a", &Value::Int(1)).unwrap();
        assert!(sub.drain().is_empty());
    }

    #[test]
    fn put_emits_one_event_by_default() {
        let s = store();
        let sub = s.bus.register_collecting();
        s.put("/a", &Value::Int(1)).unwrap();
        let events = sub.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key, "/a");
    }

    #[test]
    fn ttl_zero_behaves_as_plain_put() {
        let s = store();
        s.put_with_ttl("/a", &Value::Int(1), 0).unwrap();
        assert!(s.get_expiration("/a").unwrap().is_none());
    }

    #[test]
    fn batch_commits_and_emits_single_event() {
        let s = store();
        let sub = s.bus.register_collecting();
        let b = s.batch().put("/a", &Value::Int(1)).delete("/a");
        let affected = s.commit_batch(b, WriteOptions::default()).unwrap();
        assert_eq!(affected, vec!["/a", "/a"]);
        let events = sub.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Batch);
        assert!(s.get("/a").is_err());
    }
}
