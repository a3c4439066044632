//! HTTP gateway: request/response envelope, auth, handlers, middleware,
//! the router, and graceful shutdown control (§6).

pub mod auth;
pub mod envelope;
pub mod handlers;
pub mod middleware;
pub mod router;
pub mod shutdown;

pub use handlers::AppState;
pub use router::NetworkModule;
pub use shutdown::{HealthState, ShutdownController};
