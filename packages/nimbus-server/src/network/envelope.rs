//! The `{success, data?, error?, message?, request_id, timestamp}` envelope
//! every HTTP response wears (§6).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use nimbus_core::EngineError;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub request_id: String,
    pub timestamp: u64,
}

impl<T: Serialize> Envelope<T> {
    #[must_use]
    pub fn ok(data: T) -> Self {
        Self { success: true, data: Some(data), error: None, message: None, request_id: new_request_id(), timestamp: now_millis() }
    }
}

#[must_use]
pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

#[must_use]
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Wraps an [`EngineError`] so handlers can return it directly; the `?`
/// operator on a handler returning `Result<_, ApiError>` does the rest.
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let body: Envelope<()> = Envelope {
            success: false,
            data: None,
            error: Some(self.0.code().to_string()),
            message: Some(self.0.to_string()),
            request_id: new_request_id(),
            timestamp: now_millis(),
        };
        (status, Json(body)).into_response()
    }
}

fn status_for(err: &EngineError) -> StatusCode {
    match err.code() {
        "not_found" => StatusCode::NOT_FOUND,
        "invalid" => StatusCode::BAD_REQUEST,
        "conflict" => StatusCode::CONFLICT,
        "unauthorized" => StatusCode::UNAUTHORIZED,
        "timeout" => StatusCode::GATEWAY_TIMEOUT,
        "cancelled" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// The return type of nearly every handler: an envelope on success, or an
/// `ApiError` that renders its own envelope on failure.
pub type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

pub fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope::ok(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_404() {
        let resp = ApiError(EngineError::not_found("/a")).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn invalid_maps_to_400() {
        let resp = ApiError(EngineError::invalid("bad")).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn conflict_maps_to_409() {
        let resp = ApiError(EngineError::conflict("dup")).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn internal_maps_to_500() {
        let resp = ApiError(EngineError::internal("oops")).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn ok_envelope_omits_error_fields() {
        let json = serde_json::to_value(Envelope::ok(42)).unwrap();
        assert_eq!(json["success"], serde_json::json!(true));
        assert_eq!(json["data"], serde_json::json!(42));
        assert!(json.get("error").is_none());
    }
}
