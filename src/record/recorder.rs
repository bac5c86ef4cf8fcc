//! Per-request record file lifecycle
//!
//! [`Recorder::prepare_log_file`] creates the dated output file, reserves the
//! header slot, and dumps the request region. The proxy then appends the
//! delimiter, response head, and body chunks through [`LogInfo`], and
//! [`Recorder::update_log_file`] back-patches the header slot once the
//! response is fully drained.

use super::{encode_header_block, padding_block, LayoutInfo, MetaData, RecordHeader, FORMAT_VERSION};
use crate::error::Result;
use chrono::Utc;
use http::header::{AUTHORIZATION, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, StatusCode, Version};
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use tracing::debug;

/// Authorization value substituted into the dump when key masking is on.
const MASKED_AUTHORIZATION: &str = "Bearer fake-key-logging";

/// Creates and finalizes record files under the output directory.
pub struct Recorder {
    output_dir: PathBuf,
    mask_key: bool,
}

/// One request's open record file plus its in-progress header state.
///
/// Exclusive to a single request; the HTTP stack serializes reads of one
/// response body, so no locking is needed. Mid-stream append errors are
/// swallowed: recording must never break the live request.
pub struct LogInfo {
    file: Option<File>,
    pub path: PathBuf,
    pub header: RecordHeader,
}

impl LogInfo {
    /// Write the single `\n` separating the request region from the
    /// response head.
    pub fn append_delimiter(&mut self) {
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.write_all(b"\n") {
                debug!(path = %self.path.display(), error = %e, "delimiter write failed");
            }
        }
    }

    /// Dump the response status line and headers, recording their length.
    ///
    /// `Transfer-Encoding` is skipped: the body region holds decoded bytes,
    /// so the recorded head must not promise chunked framing.
    pub fn append_response_head(&mut self, version: Version, status: StatusCode, headers: &HeaderMap) {
        let mut head = format!(
            "{} {} {}\r\n",
            version_str(version),
            status.as_u16(),
            status.canonical_reason().unwrap_or(""),
        );
        for (name, value) in headers {
            if name == TRANSFER_ENCODING {
                continue;
            }
            head.push_str(name.as_str());
            head.push_str(": ");
            head.push_str(&String::from_utf8_lossy(value.as_bytes()));
            head.push_str("\r\n");
        }
        head.push_str("\r\n");

        if let Some(file) = self.file.as_mut() {
            match file.write_all(head.as_bytes()) {
                Ok(()) => self.header.layout.res_header_len = head.len() as u64,
                Err(e) => {
                    debug!(path = %self.path.display(), error = %e, "response head write failed")
                }
            }
        }
    }

    /// Append one response body chunk, counting the bytes actually written.
    pub fn append_body_chunk(&mut self, chunk: &[u8]) {
        if let Some(file) = self.file.as_mut() {
            match file.write(chunk) {
                Ok(n) => self.header.layout.res_body_len += n as u64,
                Err(e) => debug!(path = %self.path.display(), error = %e, "body chunk write failed"),
            }
        }
    }

    fn take_file(&mut self) -> Option<File> {
        self.file.take()
    }
}

impl Recorder {
    pub fn new(output_dir: impl Into<PathBuf>, mask_key: bool) -> Self {
        Self {
            output_dir: output_dir.into(),
            mask_key,
        }
    }

    /// Open a new record file for the request and write the padding slot,
    /// the request dump, and the raw request body.
    ///
    /// The caller passes the already-buffered body; the model name is taken
    /// from its JSON `model` field, falling back to `list_models` for
    /// `/models` paths and `unknown-model` otherwise.
    pub fn prepare_log_file(
        &self,
        parts: &http::request::Parts,
        body: &[u8],
        client_ip: &str,
        upstream_base: &str,
    ) -> Result<LogInfo> {
        let model = derive_model(body, parts.uri.path());
        let host = upstream_host(upstream_base);

        let now = Utc::now();
        let dir = self
            .output_dir
            .join(sanitize_component(&host))
            .join(sanitize_component(&model))
            .join(now.format("%Y").to_string())
            .join(now.format("%m").to_string())
            .join(now.format("%d").to_string());
        std::fs::create_dir_all(&dir)?;

        let file_name = format!(
            "{}_{}.http",
            now.format("%Y%m%d_%H%M%S"),
            now.timestamp_subsec_nanos()
        );
        let path = dir.join(file_name);
        let mut file = File::create(&path)?;

        file.write_all(&padding_block())?;

        let dump = dump_request(parts, self.mask_key);
        file.write_all(&dump)?;
        file.write_all(body)?;

        let header = RecordHeader {
            version: FORMAT_VERSION.to_string(),
            meta: MetaData {
                request_id: now.timestamp_nanos_opt().unwrap_or_default().to_string(),
                time: Some(now),
                model,
                url: parts.uri.to_string(),
                method: parts.method.to_string(),
                client_ip: client_ip.to_string(),
                ttft_ms: -1,
                ..MetaData::default()
            },
            layout: LayoutInfo {
                req_header_len: dump.len() as u64,
                req_body_len: body.len() as u64,
                ..LayoutInfo::default()
            },
            usage: Default::default(),
        };

        Ok(LogInfo {
            file: Some(file),
            path,
            header,
        })
    }

    /// Serialize the header state into the slot at offset zero and close the
    /// file. A second call on the same [`LogInfo`] is a no-op.
    pub fn update_log_file(&self, info: &mut LogInfo) -> Result<()> {
        let Some(mut file) = info.take_file() else {
            return Ok(());
        };
        let block = encode_header_block(&info.header)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&block)?;
        file.flush()?;
        Ok(())
    }
}

/// Model name for the directory tree and header metadata.
fn derive_model(body: &[u8], path: &str) -> String {
    #[derive(serde::Deserialize)]
    struct Probe {
        #[serde(default)]
        model: String,
    }

    if !body.is_empty() {
        if let Ok(probe) = serde_json::from_slice::<Probe>(body) {
            if !probe.model.is_empty() {
                return probe.model;
            }
        }
    }
    if path.ends_with("/models") {
        return "list_models".to_string();
    }
    "unknown-model".to_string()
}

/// Host (with port, if any) of the upstream base URL, for the first path
/// component of the output tree.
fn upstream_host(base: &str) -> String {
    match base.parse::<http::Uri>() {
        Ok(uri) => match (uri.host(), uri.port_u16()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => "unknown".to_string(),
        },
        Err(_) => "unknown".to_string(),
    }
}

/// Keep client-supplied names from escaping the output tree.
fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Request start-line + headers + CRLF, with the Authorization value masked
/// when configured. The live request headers are never touched; the dump
/// works from a clone.
fn dump_request(parts: &http::request::Parts, mask_key: bool) -> Vec<u8> {
    let mut headers = parts.headers.clone();
    if mask_key && headers.contains_key(AUTHORIZATION) {
        headers.insert(AUTHORIZATION, HeaderValue::from_static(MASKED_AUTHORIZATION));
    }

    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut dump = format!("{} {} {}\r\n", parts.method, target, version_str(parts.version));
    for (name, value) in &headers {
        dump.push_str(name.as_str());
        dump.push_str(": ");
        dump.push_str(&String::from_utf8_lossy(value.as_bytes()));
        dump.push_str("\r\n");
    }
    dump.push_str("\r\n");
    dump.into_bytes()
}

fn version_str(version: Version) -> &'static str {
    if version == Version::HTTP_10 {
        "HTTP/1.0"
    } else if version == Version::HTTP_2 {
        "HTTP/2.0"
    } else {
        "HTTP/1.1"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{decode_header_block, HEADER_LEN};
    use http::Request;
    use std::io::Read;

    fn request_parts(body: &str) -> http::request::Parts {
        let (parts, _) = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("host", "localhost:8080")
            .header("content-type", "application/json")
            .header("authorization", "Bearer sk-secret")
            .header("content-length", body.len().to_string())
            .body(())
            .unwrap()
            .into_parts();
        parts
    }

    #[test]
    fn derive_model_prefers_json_field() {
        assert_eq!(derive_model(br#"{"model":"qwen3-max"}"#, "/v1/chat/completions"), "qwen3-max");
        assert_eq!(derive_model(b"", "/v1/models"), "list_models");
        assert_eq!(derive_model(br#"{"stream":true}"#, "/v1/models"), "list_models");
        assert_eq!(derive_model(b"not json", "/v1/chat/completions"), "unknown-model");
        assert_eq!(derive_model(b"", "/v1/embeddings"), "unknown-model");
    }

    #[test]
    fn upstream_host_keeps_port() {
        assert_eq!(upstream_host("https://api.example.com/v1"), "api.example.com");
        assert_eq!(upstream_host("http://10.0.0.2:8000"), "10.0.0.2:8000");
        assert_eq!(upstream_host("not a url"), "unknown");
    }

    #[test]
    fn sanitize_component_blocks_traversal() {
        assert_eq!(sanitize_component("qwen/qwen3-max"), "qwen_qwen3-max");
        assert_eq!(sanitize_component("../../etc"), "_.._etc");
        assert_eq!(sanitize_component("..."), "unknown");
        assert_eq!(sanitize_component("gpt-4o"), "gpt-4o");
    }

    #[test]
    fn dump_request_masks_authorization_without_mutating() {
        let parts = request_parts("{}");
        let dump = dump_request(&parts, true);
        let text = String::from_utf8(dump).unwrap();

        assert!(text.starts_with("POST /v1/chat/completions HTTP/1.1\r\n"));
        assert!(text.contains("authorization: Bearer fake-key-logging\r\n"));
        assert!(!text.contains("sk-secret"));
        assert!(text.ends_with("\r\n\r\n"));
        // The live request still carries the real key.
        assert_eq!(parts.headers["authorization"], "Bearer sk-secret");
    }

    #[test]
    fn dump_request_unmasked_keeps_key() {
        let parts = request_parts("{}");
        let text = String::from_utf8(dump_request(&parts, false)).unwrap();
        assert!(text.contains("authorization: Bearer sk-secret\r\n"));
    }

    #[test]
    fn prepare_and_finalize_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::new(dir.path(), false);

        let body = br#"{"model":"qwen3-max","stream":false}"#;
        let parts = request_parts(std::str::from_utf8(body).unwrap());
        let mut info = recorder
            .prepare_log_file(&parts, body, "127.0.0.1:41000", "https://api.example.com")
            .unwrap();

        assert_eq!(info.header.meta.model, "qwen3-max");
        assert_eq!(info.header.layout.req_body_len, body.len() as u64);
        assert!(info.path.starts_with(dir.path().join("api.example.com").join("qwen3-max")));

        info.append_delimiter();
        let mut res_headers = HeaderMap::new();
        res_headers.insert("content-type", HeaderValue::from_static("application/json"));
        info.append_response_head(Version::HTTP_11, StatusCode::OK, &res_headers);
        info.append_body_chunk(br#"{"usage":{"total_tokens":12}}"#);

        info.header.meta.status_code = 200;
        recorder.update_log_file(&mut info).unwrap();
        // Finalizing again is a no-op.
        recorder.update_log_file(&mut info).unwrap();

        let mut content = Vec::new();
        File::open(&info.path).unwrap().read_to_end(&mut content).unwrap();

        let header = decode_header_block(&content).unwrap();
        assert_eq!(header.expected_file_len(), content.len() as u64);
        assert_eq!(content[HEADER_LEN - 1], b'\n');
        let delim = HEADER_LEN as u64 + header.layout.req_header_len + header.layout.req_body_len;
        assert_eq!(content[delim as usize], b'\n');
        assert_eq!(header.meta.status_code, 200);
    }

    #[test]
    fn response_head_skips_transfer_encoding() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::new(dir.path(), false);
        let parts = request_parts("{}");
        let mut info = recorder
            .prepare_log_file(&parts, b"{}", "127.0.0.1:1", "https://api.example.com")
            .unwrap();

        info.append_delimiter();
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/event-stream"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        info.append_response_head(Version::HTTP_11, StatusCode::OK, &headers);
        recorder.update_log_file(&mut info).unwrap();

        let content = std::fs::read(&info.path).unwrap();
        let header = decode_header_block(&content).unwrap();
        let head_start = header.response_offset() as usize;
        let head_end = head_start + header.layout.res_header_len as usize;
        let head = String::from_utf8_lossy(&content[head_start..head_end]);
        assert!(head.contains("content-type: text/event-stream"));
        assert!(!head.to_lowercase().contains("transfer-encoding"));
    }
}
