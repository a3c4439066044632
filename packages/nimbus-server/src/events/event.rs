//! The event record published on every mutation.

use std::collections::BTreeMap;

use nimbus_core::{EventTimestamp, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Put,
    Delete,
    Batch,
    TtlExpired,
}

impl EventType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Put => "put",
            Self::Delete => "delete",
            Self::Batch => "batch",
            Self::TtlExpired => "ttl_expired",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: EventType,
    pub key: String,
    pub value: Value,
    pub timestamp: EventTimestamp,
    pub metadata: BTreeMap<String, String>,
    /// Populated only for [`EventType::Batch`]: every key touched by the
    /// committed batch, in call order.
    pub affected_keys: Vec<String>,
}

impl Event {
    #[must_use]
    pub fn new(event_type: EventType, key: String, value: Value, timestamp: EventTimestamp) -> Self {
        Self { event_type, key, value, timestamp, metadata: BTreeMap::new(), affected_keys: Vec::new() }
    }

    #[must_use]
    pub fn ttl_expired(key: String, last_value: Value, expired_at: u64, timestamp: EventTimestamp) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("expiredAt".to_string(), expired_at.to_string());
        Self { event_type: EventType::TtlExpired, key, value: last_value, timestamp, metadata, affected_keys: Vec::new() }
    }

    #[must_use]
    pub fn with_metadata(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.metadata.insert(k.into(), v.into());
        self
    }
}
