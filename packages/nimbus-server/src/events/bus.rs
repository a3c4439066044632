//! Fans out published events to registered subscribers.
//!
//! Publishing is non-blocking for callback and channel subscribers; script
//! delivery hands off to whatever [`ScriptSink`] was wired in at
//! registration time. The subscriber list is copy-on-write
//! ([`SubscriberRegistry`]) so publish never blocks registration.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use nimbus_core::EngineResult;
use parking_lot::Mutex;
use tracing::warn;

use super::event::Event;
use super::subscriber::{Capabilities, EventFilter, ScriptSink, ScriptSubscription, SubId, SubscriberKind, SubscriberRegistry};

pub struct EventBus {
    registry: Arc<SubscriberRegistry>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self { registry: Arc::new(SubscriberRegistry::new()) }
    }

    #[must_use]
    pub fn registry(&self) -> &SubscriberRegistry {
        &self.registry
    }

    /// A cloneable handle onto the same registry this bus dispatches
    /// through, for callers (the script runtime) that need to look up
    /// subscription state outside of a publish.
    #[must_use]
    pub fn registry_handle(&self) -> Arc<SubscriberRegistry> {
        Arc::clone(&self.registry)
    }

    /// Walks the current subscriber snapshot and hands the event to each
    /// matching subscriber's delivery strategy. Per-subscriber FIFO is
    /// preserved by publishing from a single caller thread per `Store`;
    /// no cross-subscriber ordering is promised (§4.B).
    pub fn publish(&self, event: Event) {
        for sub in self.registry.snapshot().iter() {
            if !sub.filter.matches(event.event_type) {
                continue;
            }
            match &sub.kind {
                SubscriberKind::Callback(f) => f(&event),
                SubscriberKind::Channel { sender, dropped } => {
                    if sender.try_send(event.clone()).is_err() {
                        dropped.fetch_add(1, Ordering::SeqCst);
                        warn!(sub_id = %sub.id, "channel subscriber queue full, dropping event");
                    }
                }
                SubscriberKind::Script(script) => {
                    let generation = script.generation.load(Ordering::SeqCst);
                    let source = script.source.lock().clone();
                    script.sink.dispatch(sub.id, generation, &source, script.capabilities, script.timeout_ms, event.clone());
                }
            }
        }
    }

    pub fn register_callback(&self, filter: EventFilter, f: impl Fn(&Event) + Send + Sync + 'static) -> SubId {
        self.registry.register(filter, SubscriberKind::Callback(Arc::new(f)))
    }

    #[must_use]
    pub fn register_channel(&self, filter: EventFilter, capacity: usize) -> (SubId, tokio::sync::mpsc::Receiver<Event>) {
        let (tx, rx) = tokio::sync::mpsc::channel(capacity.max(1));
        let id = self.registry.register(filter, SubscriberKind::Channel { sender: tx, dropped: 0.into() });
        (id, rx)
    }

    pub fn register_script(
        &self,
        filter: EventFilter,
        source: String,
        timeout_ms: u64,
        capabilities: Capabilities,
        sink: Arc<dyn ScriptSink>,
    ) -> SubId {
        self.registry.register(
            filter,
            SubscriberKind::Script(ScriptSubscription {
                source: Mutex::new(source),
                timeout_ms,
                capabilities,
                generation: 0.into(),
                sink,
                errors: 0.into(),
            }),
        )
    }

    pub fn unregister(&self, id: SubId) -> EngineResult<()> {
        self.registry.unregister(id);
        Ok(())
    }

    /// Test/debug helper: a callback subscriber that just accumulates
    /// events for later inspection.
    #[must_use]
    pub fn register_collecting(&self) -> CollectingHandle {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = buf.clone();
        self.register_callback(EventFilter::all(), move |e| sink.lock().push(e.clone()));
        CollectingHandle(buf)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CollectingHandle(Arc<Mutex<Vec<Event>>>);

impl CollectingHandle {
    #[must_use]
    pub fn drain(&self) -> Vec<Event> {
        std::mem::take(&mut self.0.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::event::EventType;
    use nimbus_core::Value;

    fn ts() -> nimbus_core::EventTimestamp {
        nimbus_core::EventClock::system().tick()
    }

    #[test]
    fn callback_receives_matching_events() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0));
        let counter = hits.clone();
        bus.register_callback(EventFilter::only([EventType::Put]), move |_| *counter.lock() += 1);
        bus.publish(Event::new(EventType::Put, "/a".into(), Value::Null, ts()));
        bus.publish(Event::new(EventType::Delete, "/a".into(), Value::Null, ts()));
        assert_eq!(*hits.lock(), 1);
    }

    #[test]
    fn unregister_stops_future_delivery() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0));
        let counter = hits.clone();
        let id = bus.register_callback(EventFilter::all(), move |_| *counter.lock() += 1);
        bus.publish(Event::new(EventType::Put, "/a".into(), Value::Null, ts()));
        bus.unregister(id).unwrap();
        bus.publish(Event::new(EventType::Put, "/a".into(), Value::Null, ts()));
        assert_eq!(*hits.lock(), 1);
    }

    #[tokio::test]
    async fn channel_subscriber_receives_events_in_order() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.register_channel(EventFilter::all(), 4);
        bus.publish(Event::new(EventType::Put, "/a".into(), Value::Int(1), ts()));
        bus.publish(Event::new(EventType::Put, "/b".into(), Value::Int(2), ts()));
        assert_eq!(rx.recv().await.unwrap().key, "/a");
        assert_eq!(rx.recv().await.unwrap().key, "/b");
    }

    #[tokio::test]
    async fn channel_overflow_drops_without_blocking() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.register_channel(EventFilter::all(), 1);
        bus.publish(Event::new(EventType::Put, "/a".into(), Value::Null, ts()));
        bus.publish(Event::new(EventType::Put, "/b".into(), Value::Null, ts()));
        assert_eq!(rx.recv().await.unwrap().key, "/a");
        assert!(rx.try_recv().is_err());
    }
}
