//! Wires every component (§4) into one process-lifetime object.
//!
//! Construction order follows the dependency graph: storage before the
//! bus, the bus before anything that publishes or subscribes to it, the
//! script runtime before views and subscriptions (both drive scripts
//! through it), and the transform/stream engines last since they only
//! need a `Store` handle. `start()`/`shutdown()` are the only place that
//! cares about lifecycle order; everything else just holds `Arc`s.

use std::path::Path;
use std::sync::Arc;

use nimbus_core::EngineResult;

use crate::events::bus::EventBus;
use crate::events::manager::SubscriptionManager;
use crate::script::ScriptRuntime;
use crate::service::ServerConfig;
use crate::storage::engine::StorageEngine;
use crate::storage::kv_redb::RedbEngine;
use crate::storage::store::Store;
use crate::stream::StreamEncoder;
use crate::transform::TransformEngine;
use crate::ttl::{TtlMonitor, TtlMonitorConfig};
use crate::views::ViewEngine;

pub struct Engine {
    pub store: Arc<Store>,
    pub bus: Arc<EventBus>,
    pub script: Arc<ScriptRuntime>,
    pub ttl_monitor: Arc<TtlMonitor>,
    pub views: Arc<ViewEngine>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub transform: Arc<TransformEngine>,
    pub stream: Arc<StreamEncoder>,
    config: ServerConfig,
}

impl Engine {
    /// Opens the storage engine (on disk if `config.data_dir` is set, in
    /// memory otherwise) and constructs every component without starting
    /// any background task. Call [`Engine::start`] to bring up the TTL
    /// monitor and reinstate persisted views/subscriptions.
    pub fn open(config: ServerConfig) -> EngineResult<Arc<Self>> {
        let storage: Arc<dyn StorageEngine> = match &config.data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                Arc::new(RedbEngine::open(data_file(dir))?)
            }
            None => Arc::new(RedbEngine::in_memory()?),
        };

        let bus = Arc::new(EventBus::new());
        let store = Arc::new(Store::new(Arc::clone(&storage), Arc::clone(&bus)));
        let script = Arc::new(ScriptRuntime::new(bus.registry_handle(), config.default_script_timeout_ms));
        let ttl_monitor = Arc::new(TtlMonitor::new(Arc::clone(&storage), Arc::clone(&bus)));
        let views = Arc::new(ViewEngine::new(Arc::clone(&storage), Arc::clone(&store), Arc::clone(&script), Arc::clone(&bus)));
        let subscriptions = Arc::new(SubscriptionManager::new(Arc::clone(&storage), Arc::clone(&bus), Arc::clone(&script)));
        let transform = Arc::new(TransformEngine::new(Arc::clone(&store)));
        let stream = Arc::new(StreamEncoder::new(Arc::clone(&store)));

        Ok(Arc::new(Self { store, bus, script, ttl_monitor, views, subscriptions, transform, stream, config }))
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Reinstates persisted views and subscriptions, then starts the TTL
    /// ticker. Idempotent: a second call is a no-op for the ticker and
    /// re-reads (harmlessly re-registering) persisted state.
    pub async fn start(self: &Arc<Self>) -> EngineResult<()> {
        self.views.load_from_storage()?;
        self.subscriptions.load_from_storage()?;
        let ttl_config = TtlMonitorConfig {
            check_interval_ms: self.config.ttl_check_interval_ms,
            buffer_size: self.config.ttl_buffer_size,
        };
        self.ttl_monitor.enable(ttl_config).await;
        Ok(())
    }

    /// Graceful shutdown (§6): stops the TTL ticker so no further
    /// expirations are published, then gives in-flight script dispatches
    /// and auto-refresh debounce tasks `drain_timeout_ms` to settle. Those
    /// tasks are detached (`tokio::spawn`), so this is a best-effort wait,
    /// not a hard join.
    pub async fn shutdown(&self) {
        self.ttl_monitor.disable().await;
        tokio::time::sleep(std::time::Duration::from_millis(self.config.drain_timeout_ms)).await;
    }
}

fn data_file(dir: &Path) -> std::path::PathBuf {
    dir.join("nimbus.redb")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_and_start_succeeds() {
        let engine = Engine::open(ServerConfig::default()).unwrap();
        engine.start().await.unwrap();
        engine.store.put("/a", &nimbus_core::Value::Int(1)).unwrap();
        assert_eq!(engine.store.get("/a").unwrap(), nimbus_core::Value::Int(1));
    }

    #[tokio::test]
    async fn open_on_disk_persists_the_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig { data_dir: Some(dir.path().to_path_buf()), ..ServerConfig::default() };
        let engine = Engine::open(config).unwrap();
        engine.start().await.unwrap();
        assert!(dir.path().join("nimbus.redb").exists());
    }

    #[tokio::test]
    async fn shutdown_stops_the_ttl_monitor() {
        let config = ServerConfig { drain_timeout_ms: 0, ..ServerConfig::default() };
        let engine = Engine::open(config).unwrap();
        engine.start().await.unwrap();
        assert!(engine.ttl_monitor.is_running());
        engine.shutdown().await;
        assert!(!engine.ttl_monitor.is_running());
    }
}
