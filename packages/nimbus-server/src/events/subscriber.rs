//! Subscription records and the registry that owns their lifecycle.
//!
//! Subscribers are identified by an opaque id; the bus holds ids and a
//! lookup table, never live back-pointers into subscriber state (the
//! cyclic-reference note in the design notes collapses this way).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use nimbus_core::{EngineError, EngineResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::event::{Event, EventType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubId(pub u64);

impl std::fmt::Display for SubId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A subset of event types to deliver, or `None` for all.
#[derive(Debug, Clone, Default)]
pub struct EventFilter(pub Option<HashSet<EventType>>);

impl EventFilter {
    #[must_use]
    pub fn all() -> Self {
        Self(None)
    }

    #[must_use]
    pub fn only(types: impl IntoIterator<Item = EventType>) -> Self {
        Self(Some(types.into_iter().collect()))
    }

    #[must_use]
    pub fn matches(&self, event_type: EventType) -> bool {
        self.0.as_ref().is_none_or(|set| set.contains(&event_type))
    }
}

/// Script execution capabilities, opted into per subscription (§4.D).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Capabilities {
    pub network: bool,
    pub logging: bool,
    pub strict: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self { network: false, logging: true, strict: false }
    }
}

/// A hands-off point where the event bus delivers an event to whatever
/// executes scripts, without the bus depending on the script runtime crate
/// module directly.
pub trait ScriptSink: Send + Sync {
    fn dispatch(&self, sub_id: SubId, generation: u64, source: &str, capabilities: Capabilities, timeout_ms: u64, event: Event);
}

pub struct ScriptSubscription {
    pub source: Mutex<String>,
    pub timeout_ms: u64,
    pub capabilities: Capabilities,
    pub generation: AtomicU64,
    pub sink: Arc<dyn ScriptSink>,
    pub errors: AtomicU64,
}

pub enum SubscriberKind {
    Callback(Arc<dyn Fn(&Event) + Send + Sync>),
    Channel { sender: tokio::sync::mpsc::Sender<Event>, dropped: AtomicU64 },
    Script(ScriptSubscription),
}

pub struct Subscription {
    pub id: SubId,
    pub filter: EventFilter,
    pub kind: SubscriberKind,
}

/// Owns the lifecycle of every registered subscription. The [`super::bus::EventBus`]
/// reads a snapshot of this list on every publish via copy-on-write.
pub struct SubscriberRegistry {
    subscriptions: ArcSwap<Vec<Arc<Subscription>>>,
    by_id: Mutex<HashMap<SubId, Arc<Subscription>>>,
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self { subscriptions: ArcSwap::from_pointee(Vec::new()), by_id: Mutex::new(HashMap::new()), next_id: AtomicU64::new(1) }
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<Arc<Subscription>>> {
        self.subscriptions.load_full()
    }

    pub fn register(&self, filter: EventFilter, kind: SubscriberKind) -> SubId {
        let id = SubId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let sub = Arc::new(Subscription { id, filter, kind });
        let mut guard = self.by_id.lock();
        guard.insert(id, sub.clone());
        self.rebuild(&guard);
        id
    }

    pub fn unregister(&self, id: SubId) -> bool {
        let mut guard = self.by_id.lock();
        let removed = guard.remove(&id).is_some();
        if removed {
            self.rebuild(&guard);
        }
        removed
    }

    #[must_use]
    pub fn list(&self) -> Vec<SubId> {
        self.by_id.lock().keys().copied().collect()
    }

    #[must_use]
    pub fn get(&self, id: SubId) -> Option<Arc<Subscription>> {
        self.by_id.lock().get(&id).cloned()
    }

    /// Atomically replaces a script subscription's source without losing
    /// in-flight executions: the generation counter distinguishes
    /// executions started under the old source from those under the new
    /// one (§4.C).
    pub fn update_script_source(&self, id: SubId, new_source: String) -> EngineResult<u64> {
        let sub = self.get(id).ok_or_else(|| EngineError::not_found(id.to_string()))?;
        let SubscriberKind::Script(script) = &sub.kind else {
            return Err(EngineError::invalid("not a script subscription"));
        };
        *script.source.lock() = new_source;
        Ok(script.generation.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Records a script execution error without unregistering the
    /// subscription (§4.D: "a script that throws records the error in the
    /// subscription stats; the subscription remains registered").
    pub fn mark_script_error(&self, id: SubId) {
        if let Some(sub) = self.get(id) {
            if let SubscriberKind::Script(script) = &sub.kind {
                script.errors.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[must_use]
    pub fn script_error_count(&self, id: SubId) -> Option<u64> {
        let sub = self.get(id)?;
        let SubscriberKind::Script(script) = &sub.kind else { return None };
        Some(script.errors.load(Ordering::SeqCst))
    }

    /// The number of events dropped for a channel subscriber because its
    /// bounded queue was full at publish time (§4.B).
    #[must_use]
    pub fn channel_dropped_count(&self, id: SubId) -> Option<u64> {
        let sub = self.get(id)?;
        let SubscriberKind::Channel { dropped, .. } = &sub.kind else { return None };
        Some(dropped.load(Ordering::SeqCst))
    }

    fn rebuild(&self, by_id: &HashMap<SubId, Arc<Subscription>>) {
        let mut list: Vec<Arc<Subscription>> = by_id.values().cloned().collect();
        list.sort_by_key(|s| s.id);
        self.subscriptions.store(Arc::new(list));
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_unregister_round_trip() {
        let reg = SubscriberRegistry::new();
        let id = reg.register(EventFilter::all(), SubscriberKind::Callback(Arc::new(|_| {})));
        assert!(reg.list().contains(&id));
        assert!(reg.unregister(id));
        assert!(!reg.list().contains(&id));
    }

    #[test]
    fn unregistering_unknown_id_returns_false() {
        let reg = SubscriberRegistry::new();
        assert!(!reg.unregister(SubId(999)));
    }

    #[test]
    fn filter_all_matches_every_event_type() {
        let f = EventFilter::all();
        assert!(f.matches(EventType::Put));
        assert!(f.matches(EventType::TtlExpired));
    }

    #[test]
    fn filter_subset_excludes_other_types() {
        let f = EventFilter::only([EventType::Put]);
        assert!(f.matches(EventType::Put));
        assert!(!f.matches(EventType::Delete));
    }
}
