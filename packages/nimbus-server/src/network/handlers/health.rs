//! `GET /health`, `/stats` -- liveness/readiness and storage-wide counters.

use axum::extract::State;
use serde::Serialize;

use crate::network::envelope::{ok, ApiResult};
use crate::network::shutdown::HealthState;
use crate::storage::engine::IterationCursor;

use super::AppState;

#[derive(Serialize)]
pub struct HealthBody {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub in_flight: u64,
}

pub async fn health_handler(State(state): State<AppState>) -> ApiResult<HealthBody> {
    let status = match state.shutdown.health_state() {
        HealthState::Starting => "starting",
        HealthState::Ready => "ready",
        HealthState::Draining => "draining",
        HealthState::Stopped => "stopped",
    };
    Ok(ok(HealthBody { status, uptime_secs: state.start_time.elapsed().as_secs(), in_flight: state.shutdown.in_flight_count() }))
}

#[derive(Serialize)]
pub struct StatsBody {
    pub key_count: usize,
    pub view_count: usize,
    pub subscription_count: usize,
}

pub async fn stats_handler(State(state): State<AppState>) -> ApiResult<StatsBody> {
    let mut key_count = 0usize;
    let mut cursor = IterationCursor::start();
    loop {
        let page = state.engine.store.keys("/", &cursor, 1024).map_err(crate::network::envelope::ApiError::from)?;
        key_count += page.items.len();
        if page.next_cursor.finished {
            break;
        }
        cursor = page.next_cursor;
    }
    Ok(ok(StatsBody {
        key_count,
        view_count: state.engine.views.list_views().len(),
        subscription_count: state.engine.subscriptions.list_subscriptions().len(),
    }))
}
