//! CLI entry point: parses configuration, opens the engine, serves the
//! HTTP gateway, and drains on SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use nimbus_server::network::NetworkModule;
use nimbus_server::{Engine, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "nimbus", about = "Embedded KV engine with an HTTP gateway")]
struct Cli {
    /// Directory for the on-disk database. Omit for an ephemeral in-memory store.
    #[arg(long, env = "NIMBUS_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[arg(long, env = "NIMBUS_HTTP_HOST", default_value = "127.0.0.1")]
    http_host: String,

    #[arg(long, env = "NIMBUS_HTTP_PORT", default_value_t = 8088)]
    http_port: u16,

    /// Bearer token required on every gateway request. Unset disables auth.
    #[arg(long, env = "NIMBUS_GATEWAY_TOKEN")]
    gateway_token: Option<String>,

    #[arg(long, env = "NIMBUS_TLS_CERT")]
    tls_cert: Option<PathBuf>,

    #[arg(long, env = "NIMBUS_TLS_KEY")]
    tls_key: Option<PathBuf>,

    #[arg(long, env = "NIMBUS_CORS_ORIGINS", value_delimiter = ',')]
    cors_origins: Vec<String>,
}

impl Cli {
    fn into_config(self) -> ServerConfig {
        let mut config = ServerConfig { data_dir: self.data_dir, http_host: self.http_host, http_port: self.http_port, gateway_token: self.gateway_token, tls_cert_path: self.tls_cert, tls_key_path: self.tls_key, ..ServerConfig::default() };
        if !self.cors_origins.is_empty() {
            config.cors_origins = self.cors_origins;
        }
        config
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).json().init();

    if let Err(err) = run().await {
        tracing::error!(error = format!("{err:#}"), "nimbus exited with an error");
        std::process::exit(1);
    }
}

/// The real entry point, kept separate from `main` so the top-level error
/// path can fold every fallible step -- config, engine startup, the
/// gateway task join -- behind one `?` chain instead of a `match` per step.
async fn run() -> anyhow::Result<()> {
    let config = Cli::parse().into_config();

    let engine = Engine::open(config).context("failed to open engine")?;
    engine.start().await.context("failed to start engine")?;

    let network = Arc::new(NetworkModule::new(Arc::clone(&engine)));
    let shutdown = network.shutdown_handle();

    let network_task = {
        let network = Arc::clone(&network);
        tokio::spawn(async move { network.serve().await })
    };

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, draining");

    shutdown.trigger_shutdown();
    shutdown.wait_for_drain(Duration::from_millis(engine.config().drain_timeout_ms)).await;
    engine.shutdown().await;

    network_task.await.context("gateway task panicked")?.context("gateway exited with an error")?;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
