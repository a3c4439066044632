//! `GET /stream` -- chunked export over a key prefix (§6, §4.H).

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tokio_stream::StreamExt;

use crate::stream::{StreamFormat, StreamOptions};

use super::AppState;

#[derive(Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub jq: Option<String>,
    #[serde(default = "default_true")]
    pub include_keys: bool,
    #[serde(default)]
    pub limit: Option<usize>,
}

fn default_true() -> bool {
    true
}

fn parse_format(name: Option<&str>) -> StreamFormat {
    match name {
        Some("json") => StreamFormat::Json,
        Some("csv") => StreamFormat::Csv,
        Some("sse") => StreamFormat::Sse,
        Some("binary") => StreamFormat::Binary,
        _ => StreamFormat::Jsonl,
    }
}

fn content_type(format: StreamFormat) -> &'static str {
    match format {
        StreamFormat::Json => "application/json",
        StreamFormat::Jsonl => "application/x-ndjson",
        StreamFormat::Csv => "text/csv",
        StreamFormat::Sse => "text/event-stream",
        StreamFormat::Binary => "application/octet-stream",
    }
}

pub async fn stream_handler(State(state): State<AppState>, Query(q): Query<StreamQuery>) -> Response {
    let format = parse_format(q.format.as_deref());
    let options = StreamOptions { format, include_keys: q.include_keys, jq_filter: q.jq, ignore_errors: true, limit: q.limit };
    let prefix = q.prefix.unwrap_or_else(|| "/".to_string());
    let body_stream = state.engine.stream.encode(prefix, options).map(|item| item.map_err(std::io::Error::other));
    let body = Body::from_stream(body_stream);
    ([(header::CONTENT_TYPE, content_type(format))], body).into_response()
}
