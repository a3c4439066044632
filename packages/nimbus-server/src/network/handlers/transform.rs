//! `POST /transform/jq`, `/transform/patch` -- bulk mutation (§6, §4.G).

use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use crate::network::envelope::{ok, ApiResult};
use crate::transform::{TransformOptions, TransformSummary};

use super::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformRequestOptions {
    #[serde(default)]
    pub treat_as_string: bool,
    #[serde(default)]
    pub ignore_errors: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub prefix: bool,
}

fn default_batch_size() -> usize {
    64
}

impl Default for TransformRequestOptions {
    fn default() -> Self {
        Self { treat_as_string: false, ignore_errors: false, dry_run: false, timeout_ms: 0, batch_size: default_batch_size(), prefix: false }
    }
}

impl From<TransformRequestOptions> for TransformOptions {
    fn from(o: TransformRequestOptions) -> Self {
        TransformOptions {
            treat_as_string: o.treat_as_string,
            ignore_errors: o.ignore_errors,
            dry_run: o.dry_run,
            timeout_ms: o.timeout_ms,
            batch_size: o.batch_size,
            prefix: o.prefix,
        }
    }
}

#[derive(Deserialize)]
pub struct JqRequest {
    pub target: String,
    pub expression: String,
    #[serde(default)]
    pub options: TransformRequestOptions,
}

pub async fn transform_jq(State(state): State<AppState>, Json(req): Json<JqRequest>) -> ApiResult<TransformSummary> {
    let summary = state.engine.transform.transform_with_jq(&req.target, &req.expression, req.options.into()).await?;
    Ok(ok(summary))
}

#[derive(Deserialize)]
pub struct PatchRequest {
    pub target: String,
    pub ops: serde_json::Value,
    #[serde(default)]
    pub options: TransformRequestOptions,
}

pub async fn transform_patch(State(state): State<AppState>, Json(req): Json<PatchRequest>) -> ApiResult<TransformSummary> {
    let summary = state.engine.transform.transform_with_patch(&req.target, req.ops, req.options.into()).await?;
    Ok(ok(summary))
}
