//! Constant-time bearer-token gate for the HTTP gateway.
//!
//! `ServerConfig::gateway_token == None` disables auth entirely (local/dev
//! use only, per the field's doc comment); otherwise every request must
//! carry `Authorization: Bearer <token>` matching it.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use nimbus_core::EngineError;
use subtle::ConstantTimeEq;

use super::envelope::ApiError;
use super::handlers::AppState;

pub async fn require_token(State(state): State<AppState>, req: Request, next: Next) -> Result<Response, ApiError> {
    let Some(expected) = state.engine.config().gateway_token.as_deref() else {
        return Ok(next.run(req).await);
    };

    let presented = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let authorized = match presented {
        Some(token) if token.len() == expected.len() => token.as_bytes().ct_eq(expected.as_bytes()).into(),
        _ => false,
    };

    if !authorized {
        return Err(ApiError(EngineError::Unauthorized));
    }

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::network::shutdown::ShutdownController;
    use crate::service::ServerConfig;
    use axum::body::Body;
    use axum::middleware::from_fn_with_state;
    use axum::routing::get;
    use axum::Router;
    use std::sync::Arc;
    use std::time::Instant;
    use tower::ServiceExt;

    fn state(token: Option<&str>) -> AppState {
        let config = ServerConfig { gateway_token: token.map(str::to_string), ..ServerConfig::default() };
        let engine = Engine::open(config).unwrap();
        AppState { engine, shutdown: Arc::new(ShutdownController::new()), start_time: Instant::now() }
    }

    fn app(state: AppState) -> Router {
        Router::new().route("/x", get(|| async { "ok" })).layer(from_fn_with_state(state.clone(), require_token)).with_state(state)
    }

    #[tokio::test]
    async fn no_token_configured_allows_every_request() {
        let resp = app(state(None)).oneshot(Request::builder().uri("/x").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_header_is_rejected_when_token_configured() {
        let resp = app(state(Some("secret"))).oneshot(Request::builder().uri("/x").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_token_is_rejected() {
        let req = Request::builder().uri("/x").header("authorization", "Bearer nope").body(Body::empty()).unwrap();
        let resp = app(state(Some("secret"))).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn correct_token_is_accepted() {
        let req = Request::builder().uri("/x").header("authorization", "Bearer secret").body(Body::empty()).unwrap();
        let resp = app(state(Some("secret"))).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);
    }
}
