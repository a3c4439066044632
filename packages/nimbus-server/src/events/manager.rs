//! Caller-named script subscriptions, mirrored to storage so they survive
//! a restart (§4.C: "Script subscriptions are mirrored to
//! `/_system/subscriptions/<id>` so that on engine start, they are
//! re-registered").
//!
//! The bus itself only knows numeric [`SubId`]s; this is the layer that
//! maps a caller-chosen string id onto one, the way [`crate::views::ViewEngine`]
//! maps a view id onto its config and refresh machinery.

use std::sync::Arc;

use dashmap::DashMap;
use nimbus_core::{EngineError, EngineResult, EventClock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::events::bus::EventBus;
use crate::events::event::{Event, EventType};
use crate::events::subscriber::{Capabilities, EventFilter, SubId};
use crate::script::ScriptRuntime;
use crate::storage::engine::{IterationCursor, StorageEngine, StoredEntry};

pub const SUBSCRIPTION_PREFIX: &str = "/_system/subscriptions/";

#[must_use]
pub fn subscription_key(id: &str) -> String {
    format!("{SUBSCRIPTION_PREFIX}{id}")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionConfig {
    #[serde(default)]
    pub event_types: Option<Vec<String>>,
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default)]
    pub network: bool,
    #[serde(default = "default_logging")]
    pub logging: bool,
    #[serde(default)]
    pub strict: bool,
}

fn default_logging() -> bool {
    true
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self { event_types: None, timeout_ms: 0, network: false, logging: true, strict: false }
    }
}

impl SubscriptionConfig {
    fn filter(&self) -> EventFilter {
        let Some(names) = &self.event_types else { return EventFilter::all() };
        EventFilter::only(names.iter().filter_map(|n| parse_event_type(n)))
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { network: self.network, logging: self.logging, strict: self.strict }
    }
}

fn parse_event_type(name: &str) -> Option<EventType> {
    match name {
        "put" => Some(EventType::Put),
        "delete" => Some(EventType::Delete),
        "batch" => Some(EventType::Batch),
        "ttl_expired" => Some(EventType::TtlExpired),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRecord {
    pub id: String,
    pub source: String,
    pub config: SubscriptionConfig,
    pub created_at: u64,
}

/// Which of §4.C's three subscriber variants a [`SubscriptionInfo`]
/// describes. Callback subscribers have no caller-facing identity (the
/// caller already holds the closure), so they never show up here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionKind {
    Script,
    Channel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub id: String,
    pub kind: SubscriptionKind,
    /// `Some` for `Script`, `None` for `Channel`.
    pub source: Option<String>,
    /// `Some` for `Script`, `None` for `Channel`.
    pub config: Option<SubscriptionConfig>,
    pub created_at: u64,
    /// Script-throw count for `Script`; dropped-on-overflow count for
    /// `Channel` (§4.B: "overflow increments a drop counter").
    pub error_count: u64,
}

struct ChannelRecord {
    id: String,
    created_at: u64,
}

pub struct SubscriptionManager {
    engine: Arc<dyn StorageEngine>,
    bus: Arc<EventBus>,
    script: Arc<ScriptRuntime>,
    clock: EventClock,
    records: DashMap<String, SubscriptionRecord>,
    channels: DashMap<String, ChannelRecord>,
    handles: DashMap<String, SubId>,
}

impl SubscriptionManager {
    #[must_use]
    pub fn new(engine: Arc<dyn StorageEngine>, bus: Arc<EventBus>, script: Arc<ScriptRuntime>) -> Self {
        Self {
            engine,
            bus,
            script,
            clock: EventClock::system(),
            records: DashMap::new(),
            channels: DashMap::new(),
            handles: DashMap::new(),
        }
    }

    /// Loads every persisted subscription record and re-registers it
    /// against the bus, per §4.C.
    pub fn load_from_storage(&self) -> EngineResult<()> {
        let mut cursor = IterationCursor::start();
        loop {
            let page = self.engine.fetch_entries(SUBSCRIPTION_PREFIX, &cursor, 256)?;
            for (_, entry) in page.items {
                match serde_json::from_slice::<SubscriptionRecord>(&entry.value) {
                    Ok(record) => self.reinstate(record),
                    Err(err) => tracing::warn!("skipping corrupt subscription record: {err}"),
                }
            }
            if page.next_cursor.finished {
                break;
            }
            cursor = page.next_cursor;
        }
        Ok(())
    }

    fn reinstate(&self, record: SubscriptionRecord) {
        let sub_id = self.bus.register_script(
            record.config.filter(),
            record.source.clone(),
            record.config.timeout_ms,
            record.config.capabilities(),
            Arc::new(Arc::clone(&self.script)) as Arc<dyn crate::events::subscriber::ScriptSink>,
        );
        self.handles.insert(record.id.clone(), sub_id);
        self.records.insert(record.id.clone(), record);
    }

    pub fn create_script_subscription(&self, id: &str, source: String, config: SubscriptionConfig) -> EngineResult<()> {
        if self.exists(id) {
            return Err(EngineError::conflict(format!("subscription {id} already exists")));
        }
        let record = SubscriptionRecord { id: id.to_string(), source, config, created_at: self.clock.tick().millis };
        self.engine.put(&subscription_key(id), StoredEntry::new(serde_json::to_vec(&record)?))?;
        self.reinstate(record);
        Ok(())
    }

    /// Registers a bounded-channel subscriber under a caller-chosen id
    /// (§4.C's `createChannelSubscription(id, buffer)`), handing back the
    /// receive half directly rather than a handle -- there is no value in
    /// going back through the bus for something the caller now owns
    /// outright. Unlike script subscriptions, channel subscriptions have
    /// no JSON-serializable state to mirror to storage; they do not
    /// survive a restart, only a runtime stop/start.
    pub fn create_channel_subscription(&self, id: &str, buffer: usize) -> EngineResult<mpsc::Receiver<Event>> {
        if self.exists(id) {
            return Err(EngineError::conflict(format!("subscription {id} already exists")));
        }
        let (sub_id, rx) = self.bus.register_channel(EventFilter::all(), buffer);
        self.handles.insert(id.to_string(), sub_id);
        self.channels.insert(id.to_string(), ChannelRecord { id: id.to_string(), created_at: self.clock.tick().millis });
        Ok(rx)
    }

    fn exists(&self, id: &str) -> bool {
        self.records.contains_key(id) || self.channels.contains_key(id)
    }

    #[must_use]
    pub fn list_subscriptions(&self) -> Vec<SubscriptionInfo> {
        let scripts = self.records.iter().map(|e| self.script_info(e.value()));
        let channels = self.channels.iter().map(|e| self.channel_info(e.value()));
        scripts.chain(channels).collect()
    }

    #[must_use]
    pub fn get_subscription(&self, id: &str) -> Option<SubscriptionInfo> {
        if let Some(record) = self.records.get(id) {
            return Some(self.script_info(&record));
        }
        self.channels.get(id).map(|record| self.channel_info(&record))
    }

    fn script_info(&self, record: &SubscriptionRecord) -> SubscriptionInfo {
        let error_count = self
            .handles
            .get(&record.id)
            .and_then(|h| self.bus.registry().script_error_count(*h))
            .unwrap_or(0);
        SubscriptionInfo {
            id: record.id.clone(),
            kind: SubscriptionKind::Script,
            source: Some(record.source.clone()),
            config: Some(record.config.clone()),
            created_at: record.created_at,
            error_count,
        }
    }

    fn channel_info(&self, record: &ChannelRecord) -> SubscriptionInfo {
        let error_count = self
            .handles
            .get(&record.id)
            .and_then(|h| self.bus.registry().channel_dropped_count(*h))
            .unwrap_or(0);
        SubscriptionInfo {
            id: record.id.clone(),
            kind: SubscriptionKind::Channel,
            source: None,
            config: None,
            created_at: record.created_at,
            error_count,
        }
    }

    pub fn remove_subscription(&self, id: &str) -> EngineResult<()> {
        let existed = self.records.remove(id).is_some() || self.channels.remove(id).is_some();
        if !existed {
            return Err(EngineError::not_found(id));
        }
        if let Some((_, sub_id)) = self.handles.remove(id) {
            self.bus.unregister(sub_id)?;
        }
        self.engine.delete(&subscription_key(id))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::subscriber::SubscriberRegistry;
    use crate::storage::kv_redb::RedbEngine;

    fn manager() -> SubscriptionManager {
        let engine: Arc<dyn StorageEngine> = Arc::new(RedbEngine::in_memory().unwrap());
        let bus = Arc::new(EventBus::new());
        let script = Arc::new(ScriptRuntime::new(Arc::new(SubscriberRegistry::new()), 5_000));
        SubscriptionManager::new(engine, bus, script)
    }

    #[test]
    fn create_then_list_round_trips() {
        let mgr = manager();
        mgr.create_script_subscription("s", "event.key".to_string(), SubscriptionConfig::default()).unwrap();
        let subs = mgr.list_subscriptions();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].id, "s");
    }

    #[test]
    fn duplicate_id_is_a_conflict() {
        let mgr = manager();
        mgr.create_script_subscription("s", "1".to_string(), SubscriptionConfig::default()).unwrap();
        let err = mgr.create_script_subscription("s", "2".to_string(), SubscriptionConfig::default()).unwrap_err();
        assert!(matches!(err, EngineError::Conflict { .. }));
    }

    #[test]
    fn remove_clears_record_and_unregisters() {
        let mgr = manager();
        mgr.create_script_subscription("s", "1".to_string(), SubscriptionConfig::default()).unwrap();
        mgr.remove_subscription("s").unwrap();
        assert!(mgr.get_subscription("s").is_none());
    }

    #[tokio::test]
    async fn channel_subscription_is_listed_and_receives_events() {
        let mgr = manager();
        let mut rx = mgr.create_channel_subscription("c", 4).unwrap();
        let subs = mgr.list_subscriptions();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].kind, SubscriptionKind::Channel);
        assert!(subs[0].source.is_none());
        mgr.bus.publish(Event::new(EventType::Put, "/a".into(), nimbus_core::Value::Null, mgr.clock.tick()));
        assert_eq!(rx.recv().await.unwrap().key, "/a");
    }

    #[test]
    fn channel_and_script_ids_share_one_namespace() {
        let mgr = manager();
        mgr.create_channel_subscription("shared", 4).unwrap();
        let err = mgr.create_script_subscription("shared", "1".to_string(), SubscriptionConfig::default()).unwrap_err();
        assert!(matches!(err, EngineError::Conflict { .. }));
    }

    #[test]
    fn removing_a_channel_subscription_unregisters_it() {
        let mgr = manager();
        mgr.create_channel_subscription("c", 4).unwrap();
        mgr.remove_subscription("c").unwrap();
        assert!(mgr.get_subscription("c").is_none());
    }

    #[test]
    fn removing_unknown_id_is_not_found() {
        let mgr = manager();
        assert!(matches!(mgr.remove_subscription("missing").unwrap_err(), EngineError::NotFound { .. }));
    }

    #[test]
    fn load_from_storage_reinstates_persisted_subscriptions() {
        let engine: Arc<dyn StorageEngine> = Arc::new(RedbEngine::in_memory().unwrap());
        let bus = Arc::new(EventBus::new());
        let script = Arc::new(ScriptRuntime::new(Arc::new(SubscriberRegistry::new()), 5_000));
        {
            let mgr = SubscriptionManager::new(Arc::clone(&engine), Arc::clone(&bus), Arc::clone(&script));
            mgr.create_script_subscription("persisted", "1".to_string(), SubscriptionConfig::default()).unwrap();
        }
        let mgr = SubscriptionManager::new(engine, bus, script);
        mgr.load_from_storage().unwrap();
        assert!(mgr.get_subscription("persisted").is_some());
    }
}
