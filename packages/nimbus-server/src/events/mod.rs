//! Event pipeline: the event record ([`event`]), fan-out bus ([`bus`]),
//! subscriber lifecycle registry ([`subscriber`]), and the caller-facing,
//! persisted subscription layer ([`manager`]).

pub mod bus;
pub mod event;
pub mod manager;
pub mod subscriber;

pub use bus::{CollectingHandle, EventBus};
pub use event::{Event, EventType};
pub use manager::{SubscriptionConfig, SubscriptionInfo, SubscriptionKind, SubscriptionManager};
pub use subscriber::{Capabilities, EventFilter, ScriptSink, SubId, SubscriberRegistry};
