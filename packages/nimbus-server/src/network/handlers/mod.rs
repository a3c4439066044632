//! HTTP handlers grouped by resource (§6's route surface).

pub mod batch;
pub mod health;
pub mod keys;
pub mod query;
pub mod search;
pub mod stream;
pub mod subscriptions;
pub mod transform;
pub mod views;

use std::sync::Arc;
use std::time::Instant;

use crate::engine::Engine;
use crate::network::shutdown::ShutdownController;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub shutdown: Arc<ShutdownController>,
    pub start_time: Instant,
}
