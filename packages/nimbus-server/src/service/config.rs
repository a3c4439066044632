//! Server-level configuration: storage location, gateway binding, and the
//! ambient tunables for the TTL monitor and script runtime.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory holding the on-disk `redb` file. `None` selects an
    /// in-memory engine (used by tests and ephemeral runs).
    pub data_dir: Option<PathBuf>,
    pub http_host: String,
    pub http_port: u16,
    /// Bearer token the HTTP gateway requires on every request. `None`
    /// disables auth entirely (intended for local/dev use only).
    pub gateway_token: Option<String>,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    pub ttl_check_interval_ms: u64,
    pub ttl_buffer_size: usize,
    pub default_script_timeout_ms: u64,
    pub subscriber_channel_capacity: usize,
    /// How long graceful shutdown waits for in-flight subscriber
    /// deliveries before abandoning them (§5).
    pub drain_timeout_ms: u64,
    /// Whether newly created script subscriptions get network capability
    /// by default (always an explicit per-subscription opt-in per §4.D;
    /// this only seeds the default presented to callers).
    pub script_network_default: bool,
    /// Allowed CORS origins for the HTTP gateway. `["*"]` allows any.
    pub cors_origins: Vec<String>,
    pub request_timeout_ms: u64,
    /// Caps requests processed concurrently by the gateway; excess requests
    /// queue at the Tower layer rather than piling onto the storage engine.
    pub max_concurrent_requests: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            http_host: "127.0.0.1".to_string(),
            http_port: 8088,
            gateway_token: None,
            tls_cert_path: None,
            tls_key_path: None,
            ttl_check_interval_ms: 1_000,
            ttl_buffer_size: 256,
            default_script_timeout_ms: 5_000,
            subscriber_channel_capacity: 256,
            drain_timeout_ms: 30_000,
            script_network_default: false,
            cors_origins: vec!["*".to_string()],
            request_timeout_ms: 30_000,
            max_concurrent_requests: 512,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_safe_for_local_dev() {
        let config = ServerConfig::default();
        assert!(config.data_dir.is_none());
        assert!(config.gateway_token.is_none());
        assert_eq!(config.http_port, 8088);
    }
}
