//! Tower layer stack applied to the whole HTTP gateway (§6).
//!
//! Order matters: request id first (so every later layer's spans carry it),
//! then tracing, then the outward-facing concerns (compression, CORS,
//! timeout, concurrency cap), then request-id propagation back onto the
//! response.

use std::time::Duration;

use axum::Router;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::service::ServerConfig;

const REQUEST_ID_HEADER: &str = "x-request-id";

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }
    let parsed: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    CorsLayer::new().allow_origin(AllowOrigin::list(parsed)).allow_methods(tower_http::cors::Any)
}

/// Applies the full gateway layer stack to `router`.
pub fn apply<S>(router: Router<S>, config: &ServerConfig) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let header_name: axum::http::HeaderName = REQUEST_ID_HEADER.parse().expect("static header name parses");
    router
        .layer(SetRequestIdLayer::new(header_name.clone(), MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors_layer(&config.cors_origins))
        .layer(TimeoutLayer::new(Duration::from_millis(config.request_timeout_ms)))
        .layer(ConcurrencyLimitLayer::new(config.max_concurrent_requests))
        .layer(PropagateRequestIdLayer::new(header_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn request_id_header_is_present_on_response() {
        let config = ServerConfig::default();
        let router: Router<()> = apply(Router::new().route("/x", get(|| async { "ok" })), &config);
        let resp = router.oneshot(Request::builder().uri("/x").body(Body::empty()).unwrap()).await.unwrap();
        assert!(resp.headers().contains_key(REQUEST_ID_HEADER));
    }
}
