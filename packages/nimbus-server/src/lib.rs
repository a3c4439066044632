//! `nimbus` -- an embedded key-value store with TTL expiry, materialized
//! views, jq-driven transforms, streaming export, and script-backed event
//! subscriptions, fronted by an HTTP gateway.

pub mod engine;
pub mod events;
pub mod network;
pub mod script;
pub mod service;
pub mod storage;
pub mod stream;
pub mod transform;
pub mod ttl;
pub mod views;

pub use engine::Engine;
pub use events::{EventBus, SubscriptionConfig, SubscriptionInfo, SubscriptionKind, SubscriptionManager};
pub use nimbus_core::{EngineError, EngineResult, Value};
pub use script::ScriptRuntime;
pub use service::ServerConfig;
pub use storage::store::Store;
pub use stream::{StreamEncoder, StreamFormat, StreamOptions};
pub use transform::{TransformEngine, TransformOptions, TransformSummary};
pub use ttl::TtlMonitor;
pub use views::{View, ViewConfig, ViewEngine};

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn crate_loads_and_opens_an_in_memory_engine() {
        let engine = Engine::open(ServerConfig::default()).unwrap();
        engine.start().await.unwrap();
        engine.store.put("/smoke", &Value::Bool(true)).unwrap();
        assert_eq!(engine.store.get("/smoke").unwrap(), Value::Bool(true));
    }
}
