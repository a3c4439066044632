//! `POST /batch` -- atomic multi-key writes (§6).

use axum::extract::State;
use axum::Json;
use nimbus_core::Value;
use serde::Deserialize;

use crate::network::envelope::{ok, ApiResult};
use crate::storage::store::WriteOptions;

use super::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "lowercase", tag = "op")]
pub enum BatchOperation {
    Put { key: String, value: serde_json::Value, #[serde(default)] ttl: Option<u64> },
    Delete { key: String },
}

#[derive(Deserialize)]
pub struct BatchRequest {
    pub operations: Vec<BatchOperation>,
}

pub async fn batch_handler(State(state): State<AppState>, Json(req): Json<BatchRequest>) -> ApiResult<Vec<String>> {
    let mut batch = state.engine.store.batch();
    for op in req.operations {
        batch = match op {
            BatchOperation::Put { key, value, ttl: Some(ttl) } if ttl > 0 => {
                let expires_at = crate::network::envelope::now_millis().saturating_add(ttl);
                batch.put_with_ttl(key, &Value::from_json(value), expires_at)
            }
            BatchOperation::Put { key, value, .. } => batch.put(key, &Value::from_json(value)),
            BatchOperation::Delete { key } => batch.delete(key),
        };
    }
    let affected = state.engine.store.commit_batch(batch, WriteOptions::default())?;
    Ok(ok(affected))
}
