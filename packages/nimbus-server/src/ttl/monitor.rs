//! Periodic scan for expired keys (§4.E).
//!
//! Runs against the [`StorageEngine`] directly, not the `Store` façade,
//! because expiring keys can live anywhere -- including under
//! `/_system/` (view caches have a TTL too) -- and `Store` refuses direct
//! writes to that prefix.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nimbus_core::{EngineResult, EventClock, Value};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::events::bus::EventBus;
use crate::events::event::Event;
use crate::storage::engine::StorageEngine;

#[derive(Debug, Clone, Copy)]
pub struct TtlMonitorConfig {
    pub check_interval_ms: u64,
    pub buffer_size: usize,
}

impl Default for TtlMonitorConfig {
    fn default() -> Self {
        Self { check_interval_ms: 1_000, buffer_size: 256 }
    }
}

pub struct TtlMonitor {
    engine: Arc<dyn StorageEngine>,
    bus: Arc<EventBus>,
    clock: EventClock,
    running: AtomicBool,
    shutdown: Mutex<Option<watch::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TtlMonitor {
    #[must_use]
    pub fn new(engine: Arc<dyn StorageEngine>, bus: Arc<EventBus>) -> Self {
        Self {
            engine,
            bus,
            clock: EventClock::system(),
            running: AtomicBool::new(false),
            shutdown: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn enable(self: &Arc<Self>, config: TtlMonitorConfig) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tx, mut rx) = watch::channel(());
        *self.shutdown.lock().await = Some(tx);

        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(config.check_interval_ms));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(err) = monitor.tick_once(config.buffer_size) {
                            warn!("ttl monitor tick failed: {err}");
                        }
                    }
                    _ = rx.changed() => break,
                }
            }
        });
        *self.handle.lock().await = Some(handle);
    }

    /// Stops the ticker and waits for the current tick to drain.
    pub async fn disable(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }

    /// One scan-and-expire pass, bounded to `limit` expirations so a large
    /// backlog never produces an unbounded burst on the event bus.
    fn tick_once(&self, limit: usize) -> EngineResult<usize> {
        let now = now_millis();
        let candidates = self.engine.expiring_keys(limit)?;
        let mut expired = 0;
        for (key, expires_at) in candidates {
            if expires_at > now {
                break; // ascending order: nothing further is due yet.
            }
            let last_value = self
                .engine
                .get(&key)?
                .and_then(|entry| Value::from_json_bytes(&entry.value))
                .unwrap_or(Value::Null);
            let event = Event::ttl_expired(key.clone(), last_value, expires_at, self.clock.tick());
            // Publication precedes physical deletion so subscribers observe
            // the last value; if the bus is shutting down, deletion still
            // proceeds (§4.E).
            self.bus.publish(event);
            if let Err(err) = self.engine.delete(&key) {
                warn!(key, "ttl expiration delete failed, retrying next tick: {err}");
                continue;
            }
            expired += 1;
            debug!(key, "ttl expired");
        }
        Ok(expired)
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::engine::StoredEntry;
    use crate::storage::kv_redb::RedbEngine;

    fn monitor() -> (Arc<TtlMonitor>, Arc<dyn StorageEngine>) {
        let engine: Arc<dyn StorageEngine> = Arc::new(RedbEngine::in_memory().unwrap());
        let bus = Arc::new(EventBus::new());
        (Arc::new(TtlMonitor::new(engine.clone(), bus)), engine)
    }

    #[test]
    fn tick_expires_only_due_keys() {
        let (monitor, engine) = monitor();
        engine.put("/past", StoredEntry::with_ttl(b"1".to_vec(), 1)).unwrap();
        engine.put("/future", StoredEntry::with_ttl(b"2".to_vec(), now_millis() + 1_000_000)).unwrap();
        let expired = monitor.tick_once(100).unwrap();
        assert_eq!(expired, 1);
        assert!(!engine.has("/past").unwrap());
        assert!(engine.has("/future").unwrap());
    }

    #[test]
    fn tick_publishes_ttl_expired_before_deletion() {
        let (monitor, engine) = monitor();
        let sub = monitor.bus.register_collecting();
        engine.put("/k", StoredEntry::with_ttl(b"\"v\"".to_vec(), 1)).unwrap();
        monitor.tick_once(100).unwrap();
        let events = sub.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, crate::events::event::EventType::TtlExpired);
        assert_eq!(events[0].key, "/k");
    }

    #[tokio::test]
    async fn enable_is_idempotent_and_disable_stops_the_loop() {
        let (monitor, _engine) = monitor();
        monitor.enable(TtlMonitorConfig { check_interval_ms: 20, buffer_size: 10 }).await;
        monitor.enable(TtlMonitorConfig { check_interval_ms: 20, buffer_size: 10 }).await;
        assert!(monitor.is_running());
        monitor.disable().await;
        assert!(!monitor.is_running());
    }
}
