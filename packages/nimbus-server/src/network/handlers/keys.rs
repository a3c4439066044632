//! `GET/PUT/DELETE /keys...` and `DELETE /clear` (§6).

use axum::extract::{Path, Query, State};
use axum::Json;
use nimbus_core::{EngineError, Value};
use serde::{Deserialize, Serialize};

use crate::network::envelope::{ok, ApiError, ApiResult};
use crate::storage::engine::IterationCursor;

use super::AppState;

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub keys_only: bool,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct ListBody {
    pub keys: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<serde_json::Value>>,
}

const PAGE: usize = 256;

pub async fn list_keys(State(state): State<AppState>, Query(q): Query<ListQuery>) -> ApiResult<ListBody> {
    let prefix = q.prefix.as_deref().unwrap_or("/");
    let mut keys = Vec::new();
    let mut values = Vec::new();
    let mut cursor = IterationCursor::start();
    'outer: loop {
        if q.keys_only {
            let page = state.engine.store.keys(prefix, &cursor, PAGE)?;
            for key in page.items {
                if q.limit.is_some_and(|l| keys.len() >= l) {
                    break 'outer;
                }
                keys.push(key);
            }
            if page.next_cursor.finished {
                break;
            }
            cursor = page.next_cursor;
        } else {
            let page = state.engine.store.iterate(prefix, &cursor, PAGE)?;
            for (key, value) in page.items {
                if q.limit.is_some_and(|l| keys.len() >= l) {
                    break 'outer;
                }
                keys.push(key);
                values.push(value.to_json());
            }
            if page.next_cursor.finished {
                break;
            }
            cursor = page.next_cursor;
        }
    }
    Ok(ok(ListBody { keys, values: if q.keys_only { None } else { Some(values) } }))
}

pub async fn get_key(State(state): State<AppState>, Path(key): Path<String>) -> ApiResult<serde_json::Value> {
    let value = state.engine.store.get(&full_key(&key))?;
    Ok(ok(value.to_json()))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PutBody {
    WithTtl { value: serde_json::Value, #[serde(default)] ttl: Option<u64> },
    Raw(serde_json::Value),
}

pub async fn put_key(State(state): State<AppState>, Path(key): Path<String>, Json(body): Json<serde_json::Value>) -> ApiResult<()> {
    let parsed: PutBody = serde_json::from_value(body.clone()).unwrap_or(PutBody::Raw(body));
    let key = full_key(&key);
    match parsed {
        PutBody::WithTtl { value, ttl: Some(ttl) } if ttl > 0 => {
            state.engine.store.put_with_ttl(&key, &Value::from_json(value), ttl)?;
        }
        PutBody::WithTtl { value, .. } => state.engine.store.put(&key, &Value::from_json(value))?,
        PutBody::Raw(value) => state.engine.store.put(&key, &Value::from_json(value))?,
    }
    Ok(ok(()))
}

pub async fn delete_key(State(state): State<AppState>, Path(key): Path<String>) -> ApiResult<bool> {
    let removed = state.engine.store.delete(&full_key(&key))?;
    Ok(ok(removed))
}

#[derive(Serialize)]
pub struct KeyInfoBody {
    pub size: usize,
    pub expires_at: Option<u64>,
}

pub async fn key_info(State(state): State<AppState>, Path(key): Path<String>) -> ApiResult<KeyInfoBody> {
    let key = full_key(&key);
    if !state.engine.store.has(&key)? {
        return Err(ApiError(EngineError::not_found(key)));
    }
    let size = state.engine.store.get_size(&key)?;
    let expires_at = state.engine.store.get_expiration(&key)?;
    Ok(ok(KeyInfoBody { size, expires_at }))
}

#[derive(Deserialize)]
pub struct ClearQuery {
    #[serde(default)]
    pub confirm: bool,
    #[serde(default)]
    pub include_system: bool,
}

pub async fn clear_all(State(state): State<AppState>, Query(q): Query<ClearQuery>) -> ApiResult<u64> {
    if !q.confirm {
        return Err(ApiError(EngineError::invalid("pass ?confirm=true to wipe the keyspace")));
    }
    let removed = state.engine.store.clear(!q.include_system)?;
    Ok(ok(removed))
}

/// Path params never carry the leading slash; every stored key does.
fn full_key(path_param: &str) -> String {
    if path_param.starts_with('/') {
        path_param.to_string()
    } else {
        format!("/{path_param}")
    }
}
