//! Server-level configuration.
//!
//! HTTP is the engine's only transport (§6), so there is no internal
//! RPC-classification pipeline here: `tower-http`'s layers apply directly to
//! the `axum` router in [`crate::network`] for timeout/concurrency/tracing.
//! The engine's component set is small, fixed, and heterogeneous (storage,
//! bus, script runtime, TTL monitor, views, transforms, streams), each with
//! its own bespoke lifecycle -- [`crate::engine::Engine`] wires them
//! directly rather than through a generic named-service registry.

pub mod config;

pub use config::ServerConfig;
