//! A handle onto a single registered view.

use std::sync::Arc;

use nimbus_core::EngineResult;

use super::config::{ViewConfig, ViewResult, ViewStats};
use super::engine::ViewEngine;

#[derive(Clone)]
pub struct View {
    id: String,
    engine: Arc<ViewEngine>,
}

impl std::fmt::Debug for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("View").field("id", &self.id).finish()
    }
}

impl View {
    pub(super) fn new(id: String, engine: Arc<ViewEngine>) -> Self {
        Self { id, engine }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn execute(&self) -> EngineResult<Vec<ViewResult>> {
        self.engine.execute_view(&self.id).await
    }

    pub async fn execute_with_range(&self, start: Option<&str>, end: Option<&str>) -> EngineResult<Vec<ViewResult>> {
        self.engine.execute_view_with_range(&self.id, start, end).await
    }

    pub async fn refresh(&self) -> EngineResult<Vec<ViewResult>> {
        self.engine.refresh_view(&self.id).await
    }

    pub fn get_cached(&self) -> EngineResult<Option<Vec<ViewResult>>> {
        self.engine.get_cached(&self.id)
    }

    pub fn invalidate_cache(&self) -> EngineResult<()> {
        self.engine.invalidate_cache(&self.id)
    }

    #[must_use]
    pub fn stats(&self) -> ViewStats {
        self.engine.stats(&self.id)
    }

    pub async fn update_config(&self, config: ViewConfig) -> EngineResult<()> {
        self.engine.update_config(&self.id, config).await
    }
}
