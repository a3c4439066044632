//! `/subscriptions` and `/subscriptions/{id}` -- persisted script subscriptions
//! and ad hoc channel subscriptions (§6, §4.C).

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::events::{SubscriptionConfig, SubscriptionInfo};
use crate::network::envelope::{ok, ApiError, ApiResult};

use super::AppState;

pub async fn list_subscriptions(State(state): State<AppState>) -> ApiResult<Vec<SubscriptionInfo>> {
    Ok(ok(state.engine.subscriptions.list_subscriptions()))
}

#[derive(Deserialize)]
pub struct CreateSubscriptionRequest {
    pub id: String,
    pub source: String,
    #[serde(default)]
    pub config: SubscriptionConfig,
}

pub async fn create_subscription(State(state): State<AppState>, Json(req): Json<CreateSubscriptionRequest>) -> ApiResult<()> {
    state.engine.subscriptions.create_script_subscription(&req.id, req.source, req.config)?;
    Ok(ok(()))
}

pub async fn get_subscription(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Option<SubscriptionInfo>> {
    Ok(ok(state.engine.subscriptions.get_subscription(&id)))
}

pub async fn delete_subscription(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<()> {
    state.engine.subscriptions.remove_subscription(&id)?;
    Ok(ok(()))
}

#[derive(Deserialize)]
pub struct ChannelSubscriptionQuery {
    #[serde(default = "default_buffer")]
    pub buffer: usize,
}

fn default_buffer() -> usize {
    64
}

/// `GET /subscriptions/{id}/stream` -- the HTTP analog of
/// `createChannelSubscription(id, buffer)`: registering the channel and
/// consuming it happen in the same request, since the receive half can only
/// be handed to one caller and there is no separate place to park it between
/// a hypothetical create call and a later stream call.
pub async fn stream_channel_subscription(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<ChannelSubscriptionQuery>,
) -> Result<Response, ApiError> {
    let rx = state.engine.subscriptions.create_channel_subscription(&id, q.buffer)?;
    let body_stream = ReceiverStream::new(rx).map(|event| {
        let frame = serde_json::json!({
            "type": event.event_type.as_str(),
            "key": event.key,
            "value": event.value.to_json(),
            "timestamp": event.timestamp.millis,
            "affectedKeys": event.affected_keys,
        });
        Ok::<_, std::io::Error>(Bytes::from(format!("data: {frame}\n\n")))
    });
    let body = Body::from_stream(body_stream);
    Ok(([(header::CONTENT_TYPE, "text/event-stream")], body).into_response())
}
