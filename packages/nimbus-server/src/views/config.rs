//! Persisted view configuration (§3 "View Config").

use serde::{Deserialize, Serialize};

pub const VIEW_CONFIG_PREFIX: &str = "/_system/views/";
pub const VIEW_CACHE_PREFIX: &str = "/_system/view_cache/";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ViewConfig {
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
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ViewResult {
    pub key: String,
    pub value: nimbus_core::Value,
    pub score: f64,
    pub metadata: std::collections::BTreeMap<String, String>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ViewStats {
    pub refresh_count: u64,
    pub last_refresh: Option<u64>,
    pub result_count: usize,
    pub execution_time_ms: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
}

#[must_use]
pub fn config_key(id: &str) -> String {
    format!("{VIEW_CONFIG_PREFIX}{id}")
}

#[must_use]
pub fn cache_key(id: &str) -> String {
    format!("{VIEW_CACHE_PREFIX}{id}")
}
