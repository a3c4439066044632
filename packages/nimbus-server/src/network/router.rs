//! Builds the `axum::Router` for the HTTP gateway and drives its lifecycle:
//! bind, serve (plain or TLS), and drain on shutdown (§6).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::middleware::from_fn_with_state;
use axum::routing::{delete, get, post};
use axum::Router;
use nimbus_core::EngineResult;
use tokio::net::TcpListener;

use crate::engine::Engine;
use crate::service::ServerConfig;

use super::auth::require_token;
use super::handlers::{self, AppState};
use super::middleware;
use super::shutdown::ShutdownController;

pub struct NetworkModule {
    state: AppState,
    config: ServerConfig,
}

impl NetworkModule {
    #[must_use]
    pub fn new(engine: Arc<Engine>) -> Self {
        let config = engine.config().clone();
        let state = AppState { engine, shutdown: Arc::new(ShutdownController::new()), start_time: Instant::now() };
        Self { state, config }
    }

    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.state.shutdown)
    }

    fn router(&self) -> Router {
        let protected = Router::new()
            .route("/keys", get(handlers::keys::list_keys))
            .route("/keys/{key}", get(handlers::keys::get_key).put(handlers::keys::put_key).delete(handlers::keys::delete_key))
            .route("/keys/{key}/info", get(handlers::keys::key_info))
            .route("/keys/{key}/query", post(handlers::query::query_key))
            .route("/search", post(handlers::search::search_handler))
            .route("/query", post(handlers::query::query_prefix))
            .route("/query/aggregate", post(handlers::query::query_aggregate))
            .route("/views", get(handlers::views::list_views).post(handlers::views::create_view))
            .route(
                "/views/{id}",
                get(handlers::views::get_view).put(handlers::views::update_view).delete(handlers::views::delete_view),
            )
            .route("/views/{id}/execute", post(handlers::views::execute_view))
            .route("/views/{id}/refresh", post(handlers::views::refresh_view))
            .route("/transform/jq", post(handlers::transform::transform_jq))
            .route("/transform/patch", post(handlers::transform::transform_patch))
            .route("/stream", get(handlers::stream::stream_handler))
            .route("/batch", post(handlers::batch::batch_handler))
            .route("/subscriptions", get(handlers::subscriptions::list_subscriptions).post(handlers::subscriptions::create_subscription))
            .route(
                "/subscriptions/{id}",
                get(handlers::subscriptions::get_subscription).delete(handlers::subscriptions::delete_subscription),
            )
            .route("/subscriptions/{id}/stream", get(handlers::subscriptions::stream_channel_subscription))
            .route("/clear", delete(handlers::keys::clear_all))
            .route_layer(from_fn_with_state(self.state.clone(), require_token));

        let public = Router::new()
            .route("/health", get(handlers::health::health_handler))
            .route("/stats", get(handlers::health::stats_handler));

        let api = Router::new().merge(public).merge(protected);
        let router = Router::new().nest("/api/v1", api).with_state(self.state.clone());
        middleware::apply(router, &self.config)
    }

    /// Binds the configured address and serves until `shutdown_signal`
    /// resolves, then waits for in-flight requests to drain.
    pub async fn serve(&self) -> EngineResult<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.http_host, self.config.http_port)
            .parse()
            .map_err(|e| nimbus_core::EngineError::invalid(format!("invalid bind address: {e}")))?;

        self.state.shutdown.set_ready();
        let mut shutdown_rx = self.state.shutdown.shutdown_receiver();
        let router = self.router();

        match (&self.config.tls_cert_path, &self.config.tls_key_path) {
            (Some(cert), Some(key)) => {
                let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
                    .await
                    .map_err(|e| nimbus_core::EngineError::internal(format!("failed to load TLS material: {e}")))?;
                let handle = axum_server::Handle::new();
                let drain_handle = handle.clone();
                tokio::spawn(async move {
                    let _ = shutdown_rx.changed().await;
                    drain_handle.graceful_shutdown(None);
                });
                axum_server::bind_rustls(addr, tls_config)
                    .handle(handle)
                    .serve(router.into_make_service())
                    .await
                    .map_err(|e| nimbus_core::EngineError::internal(format!("server error: {e}")))?;
            }
            _ => {
                let listener = TcpListener::bind(addr).await?;
                axum::serve(listener, router)
                    .with_graceful_shutdown(async move {
                        let _ = shutdown_rx.changed().await;
                    })
                    .await
                    .map_err(|e| nimbus_core::EngineError::internal(format!("server error: {e}")))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn module() -> NetworkModule {
        let engine = Engine::open(ServerConfig::default()).unwrap();
        NetworkModule::new(engine)
    }

    #[tokio::test]
    async fn health_route_is_reachable_without_auth() {
        let module = module();
        let router = module.router();
        let resp = router.oneshot(Request::builder().uri("/api/v1/health").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn channel_subscription_stream_route_is_reachable() {
        let module = module();
        let router = module.router();
        let resp = router
            .oneshot(Request::builder().uri("/api/v1/subscriptions/live/stream").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("content-type").unwrap(), "text/event-stream");
    }

    #[tokio::test]
    async fn protected_route_requires_token_when_configured() {
        let engine = Engine::open(ServerConfig { gateway_token: Some("secret".into()), ..ServerConfig::default() }).unwrap();
        let module = NetworkModule::new(engine);
        let router = module.router();
        let resp = router.oneshot(Request::builder().uri("/api/v1/keys?prefix=/").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
