//! Sandboxed JS execution (§4.D).
//!
//! Each invocation gets a fresh `rquickjs` context (QuickJS has no shared
//! mutable heap across contexts, which is the isolation boundary) bound
//! with whatever named globals the caller supplies plus what `globals.rs`
//! installs for the subscription's capabilities. Compiled programs are
//! cached behind a digest-keyed cache plus a compile mutex (§5: "programs
//! are cached behind a compile mutex, keyed by source digest"), so
//! re-evaluating the same source text twice in a row skips recompilation.
//!
//! Event subscriptions (§4.D) bind `event`; the view engine's
//! filter/transform/sort scripts (§4.F) bind `data`. Both go through
//! [`ScriptRuntime::evaluate`], which only knows about named JSON bindings,
//! not which subsystem is calling it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nimbus_core::{EngineError, EngineResult, Value};
use quick_cache::sync::Cache;
use rquickjs::{CatchResultExt, Context, Runtime};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::events::event::Event;
use crate::events::subscriber::{Capabilities, ScriptSink, SubId, SubscriberRegistry};

use super::globals;

fn digest(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct ScriptRuntime {
    registry: Arc<SubscriberRegistry>,
    default_timeout_ms: u64,
    compile_guard: AsyncMutex<()>,
    compiled: Cache<String, ()>,
}

impl ScriptRuntime {
    #[must_use]
    pub fn new(registry: Arc<SubscriberRegistry>, default_timeout_ms: u64) -> Self {
        Self { registry, default_timeout_ms, compile_guard: AsyncMutex::new(()), compiled: Cache::new(256) }
    }

    /// Evaluates `source` with `event` bound as a global, returning the
    /// script's final expression value converted to [`Value`]. Bounded by
    /// `timeout_ms` (or the runtime default when zero).
    pub async fn evaluate(
        &self,
        sub_id: u64,
        source: &str,
        capabilities: Capabilities,
        event: Option<&Event>,
        timeout_ms: u64,
    ) -> EngineResult<Value> {
        let bindings = event.map(|e| {
            let mut obj = serde_json::Map::new();
            obj.insert("key".into(), serde_json::Value::String(e.key.clone()));
            obj.insert("type".into(), serde_json::Value::String(e.event_type.as_str().into()));
            obj.insert("value".into(), e.value.to_json());
            ("event".to_string(), serde_json::Value::Object(obj))
        });
        self.evaluate_with_bindings(sub_id, source, capabilities, bindings.into_iter().collect(), timeout_ms).await
    }

    /// Evaluates `source` with arbitrary named JSON globals bound
    /// (`[("data", {...})]` for the view engine, `[("event", {...})]` for
    /// subscriptions). Bounded by `timeout_ms` (or the runtime default
    /// when zero).
    pub async fn evaluate_with_bindings(
        &self,
        sub_id: u64,
        source: &str,
        capabilities: Capabilities,
        bindings: Vec<(String, serde_json::Value)>,
        timeout_ms: u64,
    ) -> EngineResult<Value> {
        let timeout_ms = if timeout_ms == 0 { self.default_timeout_ms } else { timeout_ms };
        let deadline = Duration::from_millis(timeout_ms);
        let deadline_instant = Instant::now() + deadline;

        {
            let _guard = self.compile_guard.lock().await;
            self.compiled.insert(digest(source), ());
        }

        let source = source.to_string();
        let eval = tokio::task::spawn_blocking(move || run_in_fresh_context(sub_id, &source, capabilities, &bindings, deadline_instant, timeout_ms));

        match tokio::time::timeout(deadline, eval).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(EngineError::internal(format!("script task panicked: {join_err}"))),
            Err(_) => Err(EngineError::Timeout { elapsed_ms: timeout_ms }),
        }
    }
}

/// Wraps source in an IIFE so a top-level `return` -- the idiom SPEC_FULL's
/// filter/transform scripts are written in -- evaluates instead of raising
/// a `SyntaxError` (bare top-level `return` is only legal inside a function
/// body, not in QuickJS's Program-level eval).
fn wrap_for_eval(source: &str) -> String {
    format!("(function(){{\n{source}\n}})()")
}

fn run_in_fresh_context(
    sub_id: u64,
    source: &str,
    capabilities: Capabilities,
    bindings: &[(String, serde_json::Value)],
    deadline: Instant,
    timeout_ms: u64,
) -> EngineResult<Value> {
    let runtime = Runtime::new().map_err(|e| EngineError::internal(format!("quickjs runtime: {e}")))?;

    // QuickJS only checks for interruption between bytecode instructions on
    // its own schedule, so a deadline set here is what actually halts a
    // runaway script (e.g. `while(true){}`) instead of merely abandoning
    // the blocking OS thread once the outer `tokio::time::timeout` fires.
    runtime.set_interrupt_handler(Some(Box::new(move || Instant::now() >= deadline)));

    let context = Context::full(&runtime).map_err(|e| EngineError::internal(format!("quickjs context: {e}")))?;

    context.with(|ctx| -> EngineResult<Value> {
        globals::install(&ctx, sub_id, capabilities).map_err(|e| EngineError::internal(e.to_string()))?;

        for (name, value) in bindings {
            let json_text = serde_json::to_string(value).unwrap_or_else(|_| "null".to_string());
            let parsed: rquickjs::Value = ctx
                .json_parse(json_text)
                .map_err(|e| EngineError::invalid(format!("{name} binding not JSON-representable: {e}")))?;
            ctx.globals().set(name.as_str(), parsed).map_err(|e| EngineError::internal(e.to_string()))?;
        }

        // Most filter/transform scripts are a bare expression (`data.json.active`)
        // and rely on QuickJS's Program-level completion value, which a
        // function wrapper would throw away (the function would return
        // `undefined` unless the script used `return` explicitly). So try
        // the source as-is first; only a script written with a top-level
        // `return` fails here, with a `SyntaxError` raised before any
        // statement runs, which makes retrying under a wrapper safe -- the
        // unwrapped attempt never got far enough to produce side effects.
        let first: rquickjs::Result<rquickjs::Value> = ctx.eval(source.to_string());
        let result = match first.catch(&ctx) {
            Ok(value) => Ok(value),
            Err(caught) if caught.to_string().contains("return") => {
                let wrapped: rquickjs::Result<rquickjs::Value> = ctx.eval(wrap_for_eval(source));
                wrapped.catch(&ctx)
            }
            Err(caught) => Err(caught),
        };
        let result = result.map_err(|e| {
            if e.to_string().contains("interrupted") {
                EngineError::Timeout { elapsed_ms: timeout_ms }
            } else {
                EngineError::invalid(format!("script error: {e}"))
            }
        })?;
        js_value_to_value(&ctx, result)
    })
}

fn js_value_to_value<'js>(ctx: &rquickjs::Ctx<'js>, value: rquickjs::Value<'js>) -> EngineResult<Value> {
    let json_text: String = ctx
        .json_stringify(value)
        .map_err(|e| EngineError::internal(e.to_string()))?
        .map(|s| s.to_string().unwrap_or_default())
        .unwrap_or_else(|| "null".to_string());
    let parsed: serde_json::Value = serde_json::from_str(&json_text).unwrap_or(serde_json::Value::Null);
    Ok(Value::from_json(parsed))
}

/// Wires the runtime into the event bus as the delivery target for script
/// subscriptions (§4.C). Dispatch spawns a detached task per event rather
/// than awaiting inline, since [`crate::events::bus::EventBus::publish`]
/// must not block on script execution.
///
/// Implemented on `Arc<ScriptRuntime>` rather than `ScriptRuntime` directly
/// so the spawned task can hold a `'static` handle onto the same compiled-
/// program cache instead of standing up a throwaway one per dispatch.
impl ScriptSink for Arc<ScriptRuntime> {
    fn dispatch(&self, sub_id: SubId, generation: u64, source: &str, capabilities: Capabilities, timeout_ms: u64, event: Event) {
        let rt = Arc::clone(self);
        let source = source.to_string();
        tokio::spawn(async move {
            let current_generation = rt.registry.get(sub_id).and_then(|sub| {
                if let crate::events::subscriber::SubscriberKind::Script(s) = &sub.kind {
                    Some(s.generation.load(Ordering::SeqCst))
                } else {
                    None
                }
            });
            if current_generation.is_some_and(|g| g != generation) {
                // Source was replaced after this event was queued; the new
                // generation's executions supersede it.
                return;
            }
            if let Err(err) = rt.evaluate(sub_id.0, &source, capabilities, Some(&event), timeout_ms).await {
                warn!(sub_id = %sub_id, "script subscription error: {err}");
                rt.registry.mark_script_error(sub_id);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<SubscriberRegistry> {
        Arc::new(SubscriberRegistry::new())
    }

    #[tokio::test]
    async fn evaluates_simple_expression() {
        let rt = ScriptRuntime::new(registry(), 5_000);
        let result = rt.evaluate(1, "1 + 2", Capabilities::default(), None, 0).await.unwrap();
        assert_eq!(result, Value::Int(3));
    }

    #[tokio::test]
    async fn event_key_is_bound_as_global() {
        let rt = ScriptRuntime::new(registry(), 5_000);
        let event = Event::new(crate::events::event::EventType::Put, "/k".into(), Value::Int(1), nimbus_core::EventClock::system().tick());
        let result = rt.evaluate(1, "event.key", Capabilities::default(), Some(&event), 0).await.unwrap();
        assert_eq!(result, Value::String("/k".into()));
    }

    #[tokio::test]
    async fn arbitrary_bindings_are_exposed_by_name() {
        let rt = ScriptRuntime::new(registry(), 5_000);
        let bindings = vec![("data".to_string(), serde_json::json!({"json": {"active": true}}))];
        let result = rt.evaluate_with_bindings(1, "data.json.active", Capabilities::default(), bindings, 0).await.unwrap();
        assert_eq!(result, Value::Bool(true));
    }

    #[tokio::test]
    async fn slow_script_times_out() {
        let rt = ScriptRuntime::new(registry(), 50);
        let result = rt.evaluate(1, "while(true){}", Capabilities::default(), None, 50).await;
        assert!(matches!(result.unwrap_err(), EngineError::Timeout { .. }));
    }

    #[tokio::test]
    async fn top_level_return_evaluates_like_a_function_body() {
        let rt = ScriptRuntime::new(registry(), 5_000);
        let bindings = vec![("data".to_string(), serde_json::json!({"json": {"active": true}}))];
        let result = rt.evaluate_with_bindings(1, "return data.json.active;", Capabilities::default(), bindings, 0).await.unwrap();
        assert_eq!(result, Value::Bool(true));
    }

    #[tokio::test]
    async fn thrown_error_surfaces_as_invalid() {
        let rt = ScriptRuntime::new(registry(), 5_000);
        let result = rt.evaluate(1, "throw new Error('boom')", Capabilities::default(), None, 0).await;
        assert!(matches!(result.unwrap_err(), EngineError::Invalid { .. }));
    }
}
