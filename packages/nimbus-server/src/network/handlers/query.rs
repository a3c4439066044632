//! `POST /query`, `/query/aggregate`, `/keys/{key}/query` -- read-only jq
//! evaluation (§6), backed by [`crate::transform::TransformEngine`].

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;

use crate::network::envelope::{ok, ApiResult};
use crate::transform::TransformSummary;

use super::AppState;

#[derive(Deserialize)]
pub struct QueryRequest {
    pub prefix: String,
    pub expression: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn query_prefix(State(state): State<AppState>, Json(req): Json<QueryRequest>) -> ApiResult<TransformSummary> {
    let summary = state.engine.transform.query_with_jq(&req.prefix, &req.expression, true, req.limit).await?;
    Ok(ok(summary))
}

#[derive(Deserialize)]
pub struct KeyQueryRequest {
    pub expression: String,
}

pub async fn query_key(State(state): State<AppState>, Path(key): Path<String>, Json(req): Json<KeyQueryRequest>) -> ApiResult<TransformSummary> {
    let key = if key.starts_with('/') { key } else { format!("/{key}") };
    let summary = state.engine.transform.query_with_jq(&key, &req.expression, false, None).await?;
    Ok(ok(summary))
}

#[derive(Deserialize)]
pub struct AggregateRequest {
    pub prefix: String,
    pub expression: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn query_aggregate(State(state): State<AppState>, Json(req): Json<AggregateRequest>) -> ApiResult<Option<serde_json::Value>> {
    let result = state.engine.transform.aggregate_with_jq(&req.prefix, &req.expression, req.limit).await?;
    Ok(ok(result.map(|v| v.to_json())))
}
