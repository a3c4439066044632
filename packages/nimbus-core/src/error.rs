//! The engine-wide error type.
//!
//! Every fallible operation across the KV layer, event bus, script runtime,
//! view engine, transform engine, and stream encoder returns `Result<T,
//! EngineError>` (or wraps one). `anyhow::Error` is reserved for the process
//! boundary (`main`, background task supervisors) where no caller needs to
//! match on a specific variant.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("key not found: {key}")]
    NotFound { key: String },

    #[error("invalid request: {message}")]
    Invalid { message: String },

    #[error("conflict: {message}")]
    Conflict { message: String },

    #[error("unauthorized")]
    Unauthorized,

    #[error("operation timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl EngineError {
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid { message: message.into() }
    }

    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict { message: message.into() }
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// The stable wire/error-code string used in HTTP gateway responses and
    /// script error reporting.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Invalid { .. } => "invalid",
            Self::Conflict { .. } => "conflict",
            Self::Unauthorized => "unauthorized",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::Internal { .. } => "internal",
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::internal(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid(format!("invalid JSON: {err}"))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(EngineError::not_found("k").code(), "not_found");
        assert_eq!(EngineError::invalid("bad").code(), "invalid");
        assert_eq!(EngineError::conflict("dup").code(), "conflict");
        assert_eq!(EngineError::Unauthorized.code(), "unauthorized");
        assert_eq!(EngineError::Timeout { elapsed_ms: 5 }.code(), "timeout");
        assert_eq!(EngineError::Cancelled.code(), "cancelled");
        assert_eq!(EngineError::internal("oops").code(), "internal");
    }

    #[test]
    fn io_error_maps_to_internal() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let engine_err: EngineError = io_err.into();
        assert!(matches!(engine_err, EngineError::Internal { .. }));
    }

    #[test]
    fn json_error_maps_to_invalid() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{bad").unwrap_err();
        let engine_err: EngineError = parse_err.into();
        assert!(matches!(engine_err, EngineError::Invalid { .. }));
    }
}
