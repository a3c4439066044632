//! `POST /search` -- substring search over keys and values (§6).

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::network::envelope::{ok, ApiResult};
use crate::storage::engine::IterationCursor;

use super::AppState;

#[derive(Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub case_sensitive: bool,
    #[serde(default)]
    pub keys_only: bool,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct SearchHit {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

const PAGE: usize = 256;

pub async fn search_handler(State(state): State<AppState>, Json(req): Json<SearchRequest>) -> ApiResult<Vec<SearchHit>> {
    let needle = if req.case_sensitive { req.query.clone() } else { req.query.to_lowercase() };
    let prefix = req.prefix.as_deref().unwrap_or("/");
    let mut hits = Vec::new();
    let mut cursor = IterationCursor::start();

    'outer: loop {
        let page = state.engine.store.iterate(prefix, &cursor, PAGE)?;
        for (key, value) in page.items {
            if req.limit.is_some_and(|l| hits.len() >= l) {
                break 'outer;
            }
            let haystack_key = if req.case_sensitive { key.clone() } else { key.to_lowercase() };
            let value_text = value.to_json().to_string();
            let haystack_value = if req.case_sensitive { value_text.clone() } else { value_text.to_lowercase() };
            if haystack_key.contains(&needle) || haystack_value.contains(&needle) {
                hits.push(SearchHit { key, value: if req.keys_only { None } else { Some(value.to_json()) } });
            }
        }
        if page.next_cursor.finished {
            break;
        }
        cursor = page.next_cursor;
    }

    Ok(ok(hits))
}
