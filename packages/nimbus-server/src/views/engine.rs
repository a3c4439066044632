//! Materialized, script-driven projections over a key prefix (§4.F).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use nimbus_core::{EngineError, EngineResult, EventClock, Value};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::warn;

use crate::events::bus::EventBus;
use crate::events::event::EventType;
use crate::events::subscriber::{Capabilities, EventFilter};
use crate::script::ScriptRuntime;
use crate::storage::engine::{IterationCursor, StorageEngine, StoredEntry};
use crate::storage::store::Store;

use super::config::{cache_key, config_key, ViewConfig, ViewResult, ViewStats, VIEW_CONFIG_PREFIX};
use super::view::View;

pub struct ViewEngine {
    engine: Arc<dyn StorageEngine>,
    store: Arc<Store>,
    script: Arc<ScriptRuntime>,
    bus: Arc<EventBus>,
    clock: EventClock,
    configs: DashMap<String, ViewConfig>,
    stats: DashMap<String, ViewStats>,
    refresh_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    debounce_senders: DashMap<String, mpsc::UnboundedSender<()>>,
}

impl ViewEngine {
    #[must_use]
    pub fn new(engine: Arc<dyn StorageEngine>, store: Arc<Store>, script: Arc<ScriptRuntime>, bus: Arc<EventBus>) -> Self {
        Self {
            engine,
            store,
            script,
            bus,
            clock: EventClock::system(),
            configs: DashMap::new(),
            stats: DashMap::new(),
            refresh_locks: DashMap::new(),
            debounce_senders: DashMap::new(),
        }
    }

    /// Loads every persisted view config and reinstates auto-refresh
    /// watchers, per §4.F's "on engine start, all such records are loaded
    /// and reinstated".
    pub fn load_from_storage(self: &Arc<Self>) -> EngineResult<()> {
        let mut cursor = IterationCursor::start();
        loop {
            let page = self.engine.fetch_entries(VIEW_CONFIG_PREFIX, &cursor, 256)?;
            for (_, entry) in page.items {
                match serde_json::from_slice::<ViewConfig>(&entry.value) {
                    Ok(config) => self.reinstate(config),
                    Err(err) => warn!("skipping corrupt view config: {err}"),
                }
            }
            if page.next_cursor.finished {
                break;
            }
            cursor = page.next_cursor;
        }
        Ok(())
    }

    fn reinstate(self: &Arc<Self>, config: ViewConfig) {
        let id = config.id.clone();
        let auto_refresh = config.auto_refresh;
        self.configs.insert(id.clone(), config);
        self.stats.insert(id.clone(), ViewStats::default());
        if auto_refresh {
            self.enable_auto_refresh(&id);
        }
    }

    pub async fn create_view(self: &Arc<Self>, mut config: ViewConfig) -> EngineResult<View> {
        if self.configs.contains_key(&config.id) {
            return Err(EngineError::conflict(format!("view {} already exists", config.id)));
        }
        let now = self.clock.tick().millis;
        config.created_at = now;
        config.updated_at = now;
        self.persist_config(&config)?;
        self.reinstate(config.clone());
        Ok(View::new(config.id, Arc::clone(self)))
    }

    #[must_use]
    pub fn get_view(self: &Arc<Self>, id: &str) -> Option<View> {
        self.configs.contains_key(id).then(|| View::new(id.to_string(), Arc::clone(self)))
    }

    #[must_use]
    pub fn list_views(&self) -> Vec<ViewConfig> {
        self.configs.iter().map(|e| e.value().clone()).collect()
    }

    #[must_use]
    pub fn get_config(&self, id: &str) -> Option<ViewConfig> {
        self.configs.get(id).map(|e| e.value().clone())
    }

    pub fn remove_view(&self, id: &str) -> EngineResult<()> {
        self.configs.remove(id).ok_or_else(|| EngineError::not_found(id))?;
        self.stats.remove(id);
        self.engine.delete(&config_key(id))?;
        self.engine.delete(&cache_key(id))?;
        if let Some((_, tx)) = self.debounce_senders.remove(id) {
            drop(tx); // closing the channel ends the debounce task.
        }
        Ok(())
    }

    pub async fn execute_view(self: &Arc<Self>, id: &str) -> EngineResult<Vec<ViewResult>> {
        self.execute_view_with_range(id, None, None).await
    }

    pub async fn execute_view_with_range(
        self: &Arc<Self>,
        id: &str,
        start_override: Option<&str>,
        end_override: Option<&str>,
    ) -> EngineResult<Vec<ViewResult>> {
        let config = self.configs.get(id).map(|e| e.value().clone()).ok_or_else(|| EngineError::not_found(id))?;
        if config.enable_caching {
            if let Some(cached) = self.get_cached(id)? {
                self.bump_cache_hit(id);
                return Ok(cached);
            }
            self.bump_cache_miss(id);
        }
        self.run_and_cache(&config, start_override, end_override).await
    }

    pub async fn refresh_view(self: &Arc<Self>, id: &str) -> EngineResult<Vec<ViewResult>> {
        let config = self.configs.get(id).map(|e| e.value().clone()).ok_or_else(|| EngineError::not_found(id))?;
        let lock = self.refresh_locks.entry(id.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone();
        let _guard = lock.lock().await; // at most one refresh in flight per view.
        self.run_and_cache(&config, None, None).await
    }

    pub async fn refresh_all_views(self: &Arc<Self>) -> Vec<(String, EngineResult<Vec<ViewResult>>)> {
        let ids: Vec<String> = self.configs.iter().map(|e| e.key().clone()).collect();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push((id.clone(), self.refresh_view(&id).await));
        }
        out
    }

    async fn run_and_cache(self: &Arc<Self>, config: &ViewConfig, start: Option<&str>, end: Option<&str>) -> EngineResult<Vec<ViewResult>> {
        let start_bound = start.or(config.start_key.as_deref());
        let end_bound = end.or(config.end_key.as_deref());
        let started = std::time::Instant::now();

        let entries = self.collect_source_entries(&config.source_prefix, start_bound, end_bound)?;
        let mut results = Vec::with_capacity(entries.len());
        let mut errors = 0u64;

        for (key, value, size) in entries {
            let data = serde_json::json!({
                "key": key,
                "value": general_purpose_b64(&value),
                "json": value.to_json(),
                "size": size,
            });

            if let Some(filter) = &config.filter_script {
                match self.run_script(&config.id, filter, data.clone()).await {
                    Ok(v) if !v.is_truthy() => continue,
                    Ok(_) => {}
                    Err(err) => {
                        errors += 1;
                        warn!(view = config.id, key, "filter script error: {err}");
                        continue;
                    }
                }
            }

            let mut out_value = value;
            if let Some(transform) = &config.transform_script {
                match self.run_script(&config.id, transform, data.clone()).await {
                    Ok(v) => out_value = v,
                    Err(err) => {
                        errors += 1;
                        warn!(view = config.id, key, "transform script error: {err}");
                        continue;
                    }
                }
            }

            let mut score = 0.0;
            if let Some(sort) = &config.sort_script {
                match self.run_script(&config.id, sort, data.clone()).await {
                    Ok(Value::Int(n)) => score = n as f64,
                    Ok(Value::Float(f)) => score = f,
                    Ok(_) | Err(_) => {}
                }
            }

            results.push(ViewResult {
                key,
                value: out_value,
                score,
                metadata: Default::default(),
                timestamp: self.clock.tick().millis,
            });
        }

        if config.sort_script.is_some() {
            results.sort_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal));
        }
        if let Some(max) = config.max_results {
            results.truncate(max);
        }

        let elapsed = started.elapsed().as_millis() as u64;
        self.record_run(&config.id, results.len(), elapsed, errors);

        if config.enable_caching {
            self.persist_cache(config, &results)?;
        }

        Ok(results)
    }

    fn collect_source_entries(
        &self,
        prefix: &str,
        start: Option<&str>,
        end: Option<&str>,
    ) -> EngineResult<Vec<(String, Value, usize)>> {
        let mut cursor = IterationCursor::start();
        let mut out = Vec::new();
        loop {
            let page = self.engine.fetch_entries(prefix, &cursor, 256)?;
            for (key, entry) in page.items {
                if start.is_some_and(|s| key.as_str() < s) {
                    continue;
                }
                if end.is_some_and(|e| key.as_str() >= e) {
                    continue;
                }
                let size = entry.value.len();
                let value = Value::from_json_bytes(&entry.value).unwrap_or(Value::Null);
                out.push((key, value, size));
            }
            if page.next_cursor.finished {
                break;
            }
            cursor = page.next_cursor;
        }
        Ok(out)
    }

    async fn run_script(&self, view_id: &str, source: &str, data: serde_json::Value) -> EngineResult<Value> {
        let sub_id = hash_id(view_id);
        self.script
            .evaluate_with_bindings(sub_id, source, Capabilities::default(), vec![("data".to_string(), data)], 0)
            .await
    }

    pub fn get_cached(&self, id: &str) -> EngineResult<Option<Vec<ViewResult>>> {
        let Some(entry) = self.engine.get(&cache_key(id))? else { return Ok(None) };
        let results: Vec<ViewResult> = serde_json::from_slice(&entry.value)?;
        Ok(Some(results))
    }

    pub fn invalidate_cache(&self, id: &str) -> EngineResult<()> {
        self.engine.delete(&cache_key(id))?;
        Ok(())
    }

    pub async fn update_config(self: &Arc<Self>, id: &str, mut new_config: ViewConfig) -> EngineResult<()> {
        if !self.configs.contains_key(id) {
            return Err(EngineError::not_found(id));
        }
        new_config.id = id.to_string();
        new_config.updated_at = self.clock.tick().millis;
        self.persist_config(&new_config)?;
        self.invalidate_cache(id)?;
        // Unregister-then-reregister is not atomic: a concurrent event in
        // the gap can be missed. Auto-refresh is documented as best-effort,
        // not exactly-once, delivery (§9).
        self.debounce_senders.remove(id);
        let auto_refresh = new_config.auto_refresh;
        self.configs.insert(id.to_string(), new_config);
        if auto_refresh {
            self.enable_auto_refresh(id);
        }
        Ok(())
    }

    fn persist_config(&self, config: &ViewConfig) -> EngineResult<()> {
        self.engine.put(&config_key(&config.id), StoredEntry::new(serde_json::to_vec(config)?))?;
        Ok(())
    }

    fn persist_cache(&self, config: &ViewConfig, results: &[ViewResult]) -> EngineResult<()> {
        let bytes = serde_json::to_vec(results)?;
        let expires_at = self.clock.tick().millis.saturating_add(config.cache_ttl_millis);
        let entry = if config.cache_ttl_millis > 0 {
            StoredEntry::with_ttl(bytes, expires_at)
        } else {
            StoredEntry::new(bytes)
        };
        self.engine.put(&cache_key(&config.id), entry)?;
        Ok(())
    }

    fn record_run(&self, id: &str, result_count: usize, elapsed_ms: u64, errors: u64) {
        let mut entry = self.stats.entry(id.to_string()).or_default();
        entry.refresh_count += 1;
        entry.last_refresh = Some(self.clock.tick().millis);
        entry.result_count = result_count;
        entry.execution_time_ms = elapsed_ms;
        entry.error_count += errors;
    }

    fn bump_cache_hit(&self, id: &str) {
        self.stats.entry(id.to_string()).or_default().cache_hits += 1;
    }

    fn bump_cache_miss(&self, id: &str) {
        self.stats.entry(id.to_string()).or_default().cache_misses += 1;
    }

    #[must_use]
    pub fn stats(&self, id: &str) -> ViewStats {
        self.stats.get(id).map(|e| e.value().clone()).unwrap_or_default()
    }

    /// Subscribes to the bus for `sourcePrefix` events and spawns a
    /// debounce task: each qualifying event resets the timer; the refresh
    /// fires only after `refreshDebounce` quiet time (§4.F).
    fn enable_auto_refresh(self: &Arc<Self>, id: &str) {
        let Some(config) = self.configs.get(id).map(|e| e.value().clone()) else { return };
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        self.debounce_senders.insert(id.to_string(), tx.clone());

        let prefix = config.source_prefix.clone();
        self.bus.registry().register(
            EventFilter::only([EventType::Put, EventType::Delete, EventType::Batch]),
            crate::events::subscriber::SubscriberKind::Callback(Arc::new(move |event| {
                let matches = event.key.starts_with(&prefix) || event.affected_keys.iter().any(|k| k.starts_with(&prefix));
                if matches {
                    let _ = tx.send(());
                }
            })),
        );

        let debounce = Duration::from_millis(config.refresh_debounce_millis.max(1));
        let view_engine = Arc::clone(self);
        let id = id.to_string();
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                loop {
                    match tokio::time::timeout(debounce, rx.recv()).await {
                        Ok(Some(())) => continue,
                        Ok(None) => return,
                        Err(_) => break,
                    }
                }
                if let Err(err) = view_engine.refresh_view(&id).await {
                    warn!(view = id, "auto-refresh failed: {err}");
                }
            }
        });
    }
}

fn hash_id(s: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

fn general_purpose_b64(value: &Value) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(value.to_json_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::subscriber::SubscriberRegistry;
    use crate::storage::kv_redb::RedbEngine;

    fn engine() -> Arc<ViewEngine> {
        let storage: Arc<dyn StorageEngine> = Arc::new(RedbEngine::in_memory().unwrap());
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(Store::new(storage.clone(), bus.clone()));
        let script = Arc::new(ScriptRuntime::new(Arc::new(SubscriberRegistry::new()), 5_000));
        Arc::new(ViewEngine::new(storage, store, script, bus))
    }

    fn config(id: &str, source_prefix: &str) -> ViewConfig {
        ViewConfig {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            source_prefix: source_prefix.to_string(),
            target_prefix: String::new(),
            filter_script: None,
            transform_script: None,
            sort_script: None,
            start_key: None,
            end_key: None,
            enable_caching: false,
            cache_ttl_millis: 0,
            auto_refresh: false,
            refresh_debounce_millis: 50,
            max_results: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn filter_script_keeps_only_matching_entries() {
        let ve = engine();
        ve.store.put("/u/1", &Value::from_json(serde_json::json!({"active": true}))).unwrap();
        ve.store.put("/u/2", &Value::from_json(serde_json::json!({"active": false}))).unwrap();

        let mut cfg = config("av", "/u/");
        cfg.filter_script = Some("return data.json.active;".to_string());
        let view = ve.create_view(cfg).await.unwrap();

        let results = view.execute().await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].key, "/u/1");
    }

    #[tokio::test]
    async fn duplicate_view_id_is_a_conflict() {
        let ve = engine();
        ve.create_view(config("v1", "/a/")).await.unwrap();
        let err = ve.create_view(config("v1", "/b/")).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict { .. }));
    }

    #[tokio::test]
    async fn caching_persists_results_and_hits_on_second_call() {
        let ve = engine();
        ve.store.put("/u/1", &Value::Int(1)).unwrap();
        let mut cfg = config("cached", "/u/");
        cfg.enable_caching = true;
        cfg.cache_ttl_millis = 60_000;
        let view = ve.create_view(cfg).await.unwrap();

        let first = view.execute().await.unwrap();
        assert_eq!(first.len(), 1);
        let cached = view.get_cached().unwrap();
        assert!(cached.is_some());
    }

    #[tokio::test]
    async fn remove_view_clears_config_and_cache() {
        let ve = engine();
        let mut cfg = config("doomed", "/x/");
        cfg.enable_caching = true;
        let view = ve.create_view(cfg).await.unwrap();
        view.execute().await.unwrap();
        ve.remove_view("doomed").unwrap();
        assert!(ve.get_view("doomed").is_none());
        assert!(ve.get_cached("doomed").unwrap().is_none());
    }
}
