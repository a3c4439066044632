//! Installs the per-execution JS globals: `console`, hashing, time, and the
//! capability-gated HTTP facility. `JSON` and basic string methods are
//! QuickJS builtins and need no extra wiring.

use md5::{Digest as Md5Digest, Md5};
use rquickjs::{function::Opt, Ctx, Function, Object, Result as JsResult};
use sha2::{Digest as Sha2Digest, Sha256};
use tokio::runtime::Handle;
use tracing::{error, info, warn};

use super::capabilities::Capabilities;

pub fn install(ctx: &Ctx<'_>, sub_id: u64, capabilities: Capabilities) -> JsResult<()> {
    install_console(ctx, sub_id, capabilities.logging)?;
    install_hashes(ctx)?;
    install_time(ctx)?;
    if capabilities.network {
        install_http(ctx)?;
    }
    Ok(())
}

fn install_console(ctx: &Ctx<'_>, sub_id: u64, enabled: bool) -> JsResult<()> {
    let console = Object::new(ctx.clone())?;
    for (name, level) in [("log", "info"), ("info", "info"), ("warn", "warn"), ("error", "error")] {
        let level = level.to_string();
        console.set(
            name,
            Function::new(ctx.clone(), move |msg: String| {
                if !enabled {
                    return;
                }
                match level.as_str() {
                    "warn" => warn!(sub_id, "{msg}"),
                    "error" => error!(sub_id, "{msg}"),
                    _ => info!(sub_id, "{msg}"),
                }
            })?,
        )?;
    }
    ctx.globals().set("console", console)?;
    Ok(())
}

fn install_hashes(ctx: &Ctx<'_>) -> JsResult<()> {
    ctx.globals().set(
        "md5",
        Function::new(ctx.clone(), |input: String| {
            let mut hasher = Md5::new();
            hasher.update(input.as_bytes());
            hex::encode(hasher.finalize())
        }),
    )?;
    ctx.globals().set(
        "sha256",
        Function::new(ctx.clone(), |input: String| {
            let mut hasher = Sha256::new();
            hasher.update(input.as_bytes());
            hex::encode(hasher.finalize())
        }),
    )?;
    Ok(())
}

fn install_time(ctx: &Ctx<'_>) -> JsResult<()> {
    let time = Object::new(ctx.clone())?;
    time.set(
        "now",
        Function::new(ctx.clone(), || {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0)
        }),
    )?;
    time.set(
        "format",
        Function::new(ctx.clone(), |millis: i64| {
            let secs = millis / 1000;
            let nanos = ((millis % 1000).unsigned_abs() as u32) * 1_000_000;
            chrono::DateTime::from_timestamp(secs, nanos)
                .map(|dt| dt.to_rfc3339())
                .unwrap_or_default()
        }),
    )?;
    time.set(
        "parse",
        Function::new(ctx.clone(), |text: String| {
            chrono::DateTime::parse_from_rfc3339(&text).map(|dt| dt.timestamp_millis()).unwrap_or(0)
        }),
    )?;
    ctx.globals().set("time", time)?;
    Ok(())
}

/// Synchronous-looking `http.get/post/put/delete`, implemented by blocking
/// the current (already-dedicated, `spawn_blocking`) thread on the async
/// request. `runtime.rs`'s interrupt handler only stops QuickJS bytecode
/// between instructions, so it cannot reach into this native call while
/// it's blocked in `block_on`; a slow network call can still run past the
/// script's deadline even though the caller stops waiting on it.
fn install_http(ctx: &Ctx<'_>) -> JsResult<()> {
    let http = Object::new(ctx.clone())?;
    for method in ["get", "post", "put", "delete"] {
        http.set(
            method,
            Function::new(ctx.clone(), move |url: String, body: Opt<String>| -> String {
                let method = method.to_string();
                let body = body.0;
                Handle::current()
                    .block_on(perform_request(method, url, body))
                    .unwrap_or_default()
            })?,
        )?;
    }
    ctx.globals().set("http", http)?;
    Ok(())
}

async fn perform_request(method: String, url: String, body: Option<String>) -> Option<String> {
    let client = reqwest::Client::new();
    let mut req = match method.as_str() {
        "get" => client.get(&url),
        "post" => client.post(&url),
        "put" => client.put(&url),
        _ => client.delete(&url),
    };
    if let Some(body) = body {
        req = req.body(body);
    }
    req.send().await.ok()?.text().await.ok()
}
