//! Stream-options injection
//!
//! OpenAI-compatible providers only emit a final usage chunk on SSE streams
//! when the request carries `stream_options.include_usage=true`. Streaming
//! chat requests are rewritten to force that flag before forwarding, so the
//! sniffer can observe token accounting.

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, Method};
use serde_json::{Map, Value};

/// Rewrite a streaming chat body to set `stream_options.include_usage=true`.
///
/// Returns the re-serialized body when a rewrite happened, `None` when the
/// request is left untouched: not a JSON POST, not `stream: true`, already
/// flagged, or unparseable (parse failures forward the body unchanged).
pub fn ensure_stream_options(method: &Method, headers: &HeaderMap, body: &[u8]) -> Option<Bytes> {
    if method != Method::POST {
        return None;
    }
    let is_json = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("application/json"))
        .unwrap_or(false);
    if !is_json {
        return None;
    }

    let mut payload: Map<String, Value> = serde_json::from_slice(body).ok()?;

    if payload.get("stream") != Some(&Value::Bool(true)) {
        return None;
    }

    match payload.get_mut("stream_options") {
        Some(Value::Object(opts)) => {
            if opts.get("include_usage") == Some(&Value::Bool(true)) {
                return None;
            }
            opts.insert("include_usage".to_string(), Value::Bool(true));
        }
        _ => {
            let mut opts = Map::new();
            opts.insert("include_usage".to_string(), Value::Bool(true));
            payload.insert("stream_options".to_string(), Value::Object(opts));
        }
    }

    serde_json::to_vec(&payload).ok().map(Bytes::from)
}
