//! `/views` and `/views/{id}/...` -- materialized view management (§6, §4.F).

use axum::extract::{Path, State};
use axum::Json;
use nimbus_core::EngineError;
use serde::Deserialize;

use crate::network::envelope::{ok, ApiError, ApiResult};
use crate::views::{ViewConfig, ViewResult};

use super::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewCreateRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub source_prefix: String,
    #[serde(default)]
    pub target_prefix: String,
    #[serde(default)]
    pub filter_script: Option<String>,
    #[serde(default)]
    pub transform_script: Option<String>,
    #[serde(default)]
    pub sort_script: Option<String>,
    #[serde(default)]
    pub start_key: Option<String>,
    #[serde(default)]
    pub end_key: Option<String>,
    #[serde(default)]
    pub enable_caching: bool,
    #[serde(default)]
    pub cache_ttl_millis: u64,
    #[serde(default)]
    pub auto_refresh: bool,
    #[serde(default)]
    pub refresh_debounce_millis: u64,
    #[serde(default)]
    pub max_results: Option<usize>,
}

impl From<ViewCreateRequest> for ViewConfig {
    fn from(req: ViewCreateRequest) -> Self {
        ViewConfig {
            id: req.id,
            name: req.name,
            description: req.description,
            source_prefix: req.source_prefix,
            target_prefix: req.target_prefix,
            filter_script: req.filter_script,
            transform_script: req.transform_script,
            sort_script: req.sort_script,
            start_key: req.start_key,
            end_key: req.end_key,
            enable_caching: req.enable_caching,
            cache_ttl_millis: req.cache_ttl_millis,
            auto_refresh: req.auto_refresh,
            refresh_debounce_millis: req.refresh_debounce_millis,
            max_results: req.max_results,
            created_at: 0,
            updated_at: 0,
        }
    }
}

pub async fn list_views(State(state): State<AppState>) -> ApiResult<Vec<ViewConfig>> {
    Ok(ok(state.engine.views.list_views()))
}

pub async fn create_view(State(state): State<AppState>, Json(req): Json<ViewCreateRequest>) -> ApiResult<ViewConfig> {
    let view = state.engine.views.create_view(req.into()).await?;
    let config = state.engine.views.get_config(view.id()).ok_or_else(|| EngineError::internal("view vanished after creation"))?;
    Ok(ok(config))
}

pub async fn get_view(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<ViewConfig> {
    state.engine.views.get_config(&id).map(ok).ok_or_else(|| ApiError(EngineError::not_found(id)))
}

pub async fn update_view(State(state): State<AppState>, Path(id): Path<String>, Json(req): Json<ViewCreateRequest>) -> ApiResult<()> {
    let view = state.engine.views.get_view(&id).ok_or_else(|| EngineError::not_found(id.clone()))?;
    view.update_config(req.into()).await?;
    Ok(ok(()))
}

pub async fn delete_view(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<()> {
    state.engine.views.remove_view(&id)?;
    Ok(ok(()))
}

#[derive(Deserialize, Default)]
pub struct ExecuteQuery {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

pub async fn execute_view(
    State(state): State<AppState>,
    Path(id): Path<String>,
    axum::extract::Query(q): axum::extract::Query<ExecuteQuery>,
) -> ApiResult<Vec<ViewResult>> {
    let view = state.engine.views.get_view(&id).ok_or_else(|| EngineError::not_found(id))?;
    let results = view.execute_with_range(q.start.as_deref(), q.end.as_deref()).await?;
    Ok(ok(results))
}

pub async fn refresh_view(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Vec<ViewResult>> {
    let view = state.engine.views.get_view(&id).ok_or_else(|| EngineError::not_found(id))?;
    let results = view.refresh().await?;
    Ok(ok(results))
}
