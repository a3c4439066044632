//! Byte-stream encoders over a key-prefix iterator (§4.H).
//!
//! Every format is produced by the same background task: it walks
//! [`Store::iterate`] in pages, optionally runs each entry through a jq
//! filter, and pushes encoded chunks onto a bounded channel that becomes
//! the response body. Dropping the receiving end (client disconnect) makes
//! the next `tx.send` fail, which is how cancellation is observed.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nimbus_core::{EngineResult, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::storage::engine::IterationCursor;
use crate::storage::store::Store;
use crate::transform::jq;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const PAGE_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    Json,
    Jsonl,
    Csv,
    Sse,
    Binary,
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub format: StreamFormat,
    pub include_keys: bool,
    pub jq_filter: Option<String>,
    pub ignore_errors: bool,
    pub limit: Option<usize>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self { format: StreamFormat::Jsonl, include_keys: true, jq_filter: None, ignore_errors: true, limit: None }
    }
}

pub struct StreamEncoder {
    store: Arc<Store>,
}

impl StreamEncoder {
    #[must_use]
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Spawns the encoding task and returns the consumer-facing stream of
    /// chunks. The task runs independently of whether the caller ever polls
    /// the stream to completion.
    pub fn encode(&self, prefix: String, options: StreamOptions) -> ReceiverStream<EngineResult<Bytes>> {
        let store = Arc::clone(&self.store);
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            run(store, prefix, options, tx).await;
        });
        ReceiverStream::new(rx)
    }
}

async fn run(store: Arc<Store>, prefix: String, options: StreamOptions, tx: mpsc::Sender<EngineResult<Bytes>>) {
    match options.format {
        StreamFormat::Json => run_json(&store, &prefix, &options, &tx).await,
        StreamFormat::Jsonl => run_line_framed(&store, &prefix, &options, &tx, encode_jsonl_line).await,
        StreamFormat::Sse => run_line_framed(&store, &prefix, &options, &tx, encode_sse_frame).await,
        StreamFormat::Csv => run_csv(&store, &prefix, &options, &tx).await,
        StreamFormat::Binary => run_binary(&store, &prefix, &options, &tx).await,
    }
}

/// Applies the jq filter (if any) and the per-entry limit bookkeeping.
/// Returns `None` when the entry should be skipped (jq `null` output, or
/// an ignored error) and `Some(Err)` when it should abort the stream.
fn apply_filter(options: &StreamOptions, value: Value) -> Option<EngineResult<Value>> {
    let Some(expr) = &options.jq_filter else { return Some(Ok(value)) };
    match jq::eval_first(expr, &value) {
        Ok(Some(Value::Null) | None) => None,
        Ok(Some(v)) => Some(Ok(v)),
        Err(err) => {
            if options.ignore_errors {
                None
            } else {
                Some(Err(err))
            }
        }
    }
}

fn entry_json(key: &str, value: &Value, include_keys: bool) -> serde_json::Value {
    if include_keys {
        serde_json::json!({"key": key, "value": value.to_json()})
    } else {
        value.to_json()
    }
}

async fn run_json(store: &Store, prefix: &str, options: &StreamOptions, tx: &mpsc::Sender<EngineResult<Bytes>>) {
    if tx.send(Ok(Bytes::from_static(b"["))).await.is_err() {
        return;
    }
    let mut first = true;
    let mut emitted = 0usize;
    let mut cursor = IterationCursor::start();

    'outer: loop {
        let page = match store.iterate(prefix, &cursor, PAGE_SIZE) {
            Ok(p) => p,
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
        };
        for (key, value) in page.items {
            if options.limit.is_some_and(|l| emitted >= l) {
                break 'outer;
            }
            match apply_filter(options, value) {
                None => continue,
                Some(Err(err)) => {
                    let _ = tx.send(Err(err)).await;
                    return;
                }
                Some(Ok(v)) => {
                    let mut chunk = String::new();
                    if !first {
                        chunk.push(',');
                    }
                    first = false;
                    chunk.push_str(&entry_json(&key, &v, options.include_keys).to_string());
                    if !send_plain(tx, Bytes::from(chunk)).await {
                        return;
                    }
                    emitted += 1;
                }
            }
        }
        if page.next_cursor.finished {
            break;
        }
        cursor = page.next_cursor;
    }

    let _ = tx.send(Ok(Bytes::from_static(b"]"))).await;
}

fn encode_jsonl_line(key: &str, value: &Value, include_keys: bool) -> Bytes {
    let mut s = entry_json(key, value, include_keys).to_string();
    s.push('\n');
    Bytes::from(s)
}

fn encode_sse_frame(key: &str, value: &Value, include_keys: bool) -> Bytes {
    let data = entry_json(key, value, include_keys).to_string();
    Bytes::from(format!("event: record\ndata: {data}\n\n"))
}

async fn run_line_framed(
    store: &Store,
    prefix: &str,
    options: &StreamOptions,
    tx: &mpsc::Sender<EngineResult<Bytes>>,
    encode: fn(&str, &Value, bool) -> Bytes,
) {
    let mut emitted = 0usize;
    let mut cursor = IterationCursor::start();
    let is_sse = options.format == StreamFormat::Sse;

    'outer: loop {
        let page = match store.iterate(prefix, &cursor, PAGE_SIZE) {
            Ok(p) => p,
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
        };
        for (key, value) in page.items {
            if options.limit.is_some_and(|l| emitted >= l) {
                break 'outer;
            }
            match apply_filter(options, value) {
                None => continue,
                Some(Err(err)) => {
                    if is_sse {
                        let frame = format!("event: error\ndata: {err}\n\n");
                        if !send_with_heartbeat(tx, Bytes::from(frame)).await {
                            return;
                        }
                        continue;
                    }
                    let _ = tx.send(Err(err)).await;
                    return;
                }
                Some(Ok(v)) => {
                    let chunk = encode(&key, &v, options.include_keys);
                    let sent = if is_sse { send_with_heartbeat(tx, chunk).await } else { send_plain(tx, chunk).await };
                    if !sent {
                        return;
                    }
                    emitted += 1;
                }
            }
        }
        if page.next_cursor.finished {
            break;
        }
        cursor = page.next_cursor;
    }
}

async fn run_csv(store: &Store, prefix: &str, options: &StreamOptions, tx: &mpsc::Sender<EngineResult<Bytes>>) {
    let mut header_written = false;
    let mut emitted = 0usize;
    let mut cursor = IterationCursor::start();

    'outer: loop {
        let page = match store.iterate(prefix, &cursor, PAGE_SIZE) {
            Ok(p) => p,
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
        };
        for (key, value) in page.items {
            if options.limit.is_some_and(|l| emitted >= l) {
                break 'outer;
            }
            match apply_filter(options, value) {
                None => continue,
                Some(Err(err)) => {
                    let _ = tx.send(Err(err)).await;
                    return;
                }
                Some(Ok(v)) => {
                    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(Vec::new());
                    if !header_written {
                        if options.include_keys {
                            let _ = writer.write_record(["key", "value"]);
                        } else {
                            let _ = writer.write_record(["value"]);
                        }
                        header_written = true;
                    }
                    let cell = v.to_json().to_string();
                    let wrote = if options.include_keys {
                        writer.write_record([key.as_str(), cell.as_str()])
                    } else {
                        writer.write_record([cell.as_str()])
                    };
                    if wrote.is_err() {
                        continue;
                    }
                    let Ok(bytes) = writer.into_inner() else { continue };
                    if !send_plain(tx, Bytes::from(bytes)).await {
                        return;
                    }
                    emitted += 1;
                }
            }
        }
        if page.next_cursor.finished {
            break;
        }
        cursor = page.next_cursor;
    }
}

async fn run_binary(store: &Store, prefix: &str, options: &StreamOptions, tx: &mpsc::Sender<EngineResult<Bytes>>) {
    let mut emitted = 0usize;
    let mut cursor = IterationCursor::start();

    'outer: loop {
        let page = match store.iterate(prefix, &cursor, PAGE_SIZE) {
            Ok(p) => p,
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
        };
        for (key, value) in page.items {
            if options.limit.is_some_and(|l| emitted >= l) {
                break 'outer;
            }
            match apply_filter(options, value) {
                None => continue,
                Some(Err(err)) => {
                    let _ = tx.send(Err(err)).await;
                    return;
                }
                Some(Ok(v)) => {
                    let payload = entry_json(&key, &v, options.include_keys).to_string().into_bytes();
                    let mut framed = Vec::with_capacity(4 + payload.len());
                    #[allow(clippy::cast_possible_truncation)]
                    framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                    framed.extend_from_slice(&payload);
                    if !send_plain(tx, Bytes::from(framed)).await {
                        return;
                    }
                    emitted += 1;
                }
            }
        }
        if page.next_cursor.finished {
            break;
        }
        cursor = page.next_cursor;
    }
}

/// Sends `payload`, interleaving `: heartbeat\n\n` comment frames if the
/// receiver is slow to drain. Only SSE's framing tolerates an unsolicited
/// comment frame between records, so this is exclusive to [`run_line_framed`]'s
/// SSE branch; every other format uses [`send_plain`] instead.
async fn send_with_heartbeat(tx: &mpsc::Sender<EngineResult<Bytes>>, payload: Bytes) -> bool {
    let mut send_fut = Box::pin(tx.send(Ok(payload)));
    loop {
        tokio::select! {
            result = &mut send_fut => return result.is_ok(),
            () = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                if tx.send(Ok(Bytes::from_static(b": heartbeat\n\n"))).await.is_err() {
                    return false;
                }
            }
        }
    }
}

/// Sends `payload` with no heartbeat interleaving. Used by every format
/// whose framing a stray comment frame would corrupt (§4.H).
async fn send_plain(tx: &mpsc::Sender<EngineResult<Bytes>>, payload: Bytes) -> bool {
    tx.send(Ok(payload)).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::bus::EventBus;
    use crate::storage::kv_redb::RedbEngine;
    use futures_util::StreamExt;

    fn store() -> Arc<Store> {
        let engine: Arc<dyn crate::storage::StorageEngine> = Arc::new(RedbEngine::in_memory().unwrap());
        Arc::new(Store::new(engine, Arc::new(EventBus::new())))
    }

    async fn drain(mut stream: ReceiverStream<EngineResult<Bytes>>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn jsonl_emits_one_line_per_entry() {
        let store = store();
        store.put("/a", &Value::Int(1)).unwrap();
        store.put("/b", &Value::Int(2)).unwrap();

        let encoder = StreamEncoder::new(Arc::clone(&store));
        let options = StreamOptions { format: StreamFormat::Jsonl, ..Default::default() };
        let bytes = drain(encoder.encode("/".to_string(), options)).await;
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[tokio::test]
    async fn json_array_is_valid_json() {
        let store = store();
        store.put("/a", &Value::Int(1)).unwrap();

        let encoder = StreamEncoder::new(Arc::clone(&store));
        let options = StreamOptions { format: StreamFormat::Json, ..Default::default() };
        let bytes = drain(encoder.encode("/".to_string(), options)).await;
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(parsed.is_array());
        assert_eq!(parsed.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn jq_filter_is_applied_per_entry() {
        let store = store();
        store.put("/a", &Value::from_json(serde_json::json!({"n": 1}))).unwrap();
        store.put("/b", &Value::from_json(serde_json::json!({"n": 2}))).unwrap();

        let encoder = StreamEncoder::new(Arc::clone(&store));
        let options =
            StreamOptions { format: StreamFormat::Jsonl, jq_filter: Some(".n".to_string()), ..Default::default() };
        let bytes = drain(encoder.encode("/".to_string(), options)).await;
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains('1') && text.contains('2'));
    }

    #[tokio::test]
    async fn csv_emits_header_then_rows() {
        let store = store();
        store.put("/a", &Value::Int(1)).unwrap();

        let encoder = StreamEncoder::new(Arc::clone(&store));
        let options = StreamOptions { format: StreamFormat::Csv, ..Default::default() };
        let bytes = drain(encoder.encode("/".to_string(), options)).await;
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("key,value"));
    }

    #[tokio::test]
    async fn binary_frames_are_length_prefixed() {
        let store = store();
        store.put("/a", &Value::Int(1)).unwrap();

        let encoder = StreamEncoder::new(Arc::clone(&store));
        let options = StreamOptions { format: StreamFormat::Binary, ..Default::default() };
        let bytes = drain(encoder.encode("/".to_string(), options)).await;
        let len = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
        assert_eq!(bytes.len(), 4 + len);
    }

    #[tokio::test]
    async fn binary_frames_never_contain_a_heartbeat_comment() {
        let store = store();
        store.put("/a", &Value::Int(1)).unwrap();

        let encoder = StreamEncoder::new(Arc::clone(&store));
        let options = StreamOptions { format: StreamFormat::Binary, ..Default::default() };
        let bytes = drain(encoder.encode("/".to_string(), options)).await;
        let len = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
        assert_eq!(bytes.len(), 4 + len, "a heartbeat frame would break the length prefix");
    }

    #[tokio::test]
    async fn limit_truncates_output() {
        let store = store();
        for i in 0..5 {
            store.put(&format!("/k{i}"), &Value::Int(i)).unwrap();
        }

        let encoder = StreamEncoder::new(Arc::clone(&store));
        let options = StreamOptions { format: StreamFormat::Jsonl, limit: Some(2), ..Default::default() };
        let bytes = drain(encoder.encode("/".to_string(), options)).await;
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text.lines().count(), 2);
    }
}
