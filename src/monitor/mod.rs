//! Dashboard server
//!
//! Read-only JSON surface over the recorded file tree. The recorder is the
//! sole writer of the tree; this server only walks and reads it.
//!
//! Endpoints:
//! - `GET /records` lists newest-first header summaries of every record file
//! - `GET /records/view?path=<rel>` returns one record parsed for display
//! - `GET /records/download?path=<rel>` serves the raw `.http` file

mod parser;

pub use parser::{parse_record, ChatMessage, ParsedRecord, ToolCall, ToolFunction};

use crate::error::Result;
use crate::record::{decode_header_block, RecordHeader, HEADER_LEN};
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::io::Read;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Header summary of one record file, for the list view.
#[derive(Debug, Serialize)]
pub struct RecordSummary {
    /// Path relative to the output root.
    pub path: String,
    pub model: String,
    pub time: Option<chrono::DateTime<chrono::Utc>>,
    pub status_code: u16,
    pub total_tokens: u64,
    pub is_stream: bool,
    pub duration_ms: i64,
}

/// Dashboard server over one output directory.
pub struct MonitorServer {
    output_dir: PathBuf,
    port: u16,
}

impl MonitorServer {
    pub fn new(output_dir: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            output_dir: output_dir.into(),
            port,
        }
    }

    pub async fn run(self) -> Result<()> {
        let addr: SocketAddr = ([0, 0, 0, 0], self.port).into();
        let listener = TcpListener::bind(addr).await?;
        info!("Monitor dashboard listening on {}", addr);

        let output_dir = self.output_dir;
        loop {
            let (stream, _peer) = listener.accept().await?;
            let output_dir = output_dir.clone();

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req: Request<Incoming>| {
                    let output_dir = output_dir.clone();
                    async move { Ok::<_, std::convert::Infallible>(route(&output_dir, &req)) }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("Monitor connection error: {}", e);
                }
            });
        }
    }
}

fn route(output_dir: &Path, req: &Request<Incoming>) -> Response<Full<Bytes>> {
    if req.method() != Method::GET {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "GET only");
    }

    match req.uri().path() {
        "/" | "/records" => list_records(output_dir),
        "/records/view" => match record_path_param(output_dir, req.uri().query()) {
            Some(path) => view_record(&path),
            None => text_response(StatusCode::BAD_REQUEST, "missing or invalid path parameter"),
        },
        "/records/download" => match record_path_param(output_dir, req.uri().query()) {
            Some(path) => download_record(&path),
            None => text_response(StatusCode::BAD_REQUEST, "missing or invalid path parameter"),
        },
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    }
}

fn list_records(output_dir: &Path) -> Response<Full<Bytes>> {
    let mut summaries = Vec::new();
    let mut paths = Vec::new();
    collect_record_files(output_dir, &mut paths);

    for path in paths {
        match read_record_header(&path) {
            Ok(header) => {
                let rel = path
                    .strip_prefix(output_dir)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .into_owned();
                summaries.push(RecordSummary {
                    path: rel,
                    model: header.meta.model,
                    time: header.meta.time,
                    status_code: header.meta.status_code,
                    total_tokens: header.usage.total_tokens,
                    is_stream: header.layout.is_stream,
                    duration_ms: header.meta.duration_ms,
                });
            }
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unparseable record"),
        }
    }

    summaries.sort_by(|a, b| b.time.cmp(&a.time));
    json_response(StatusCode::OK, &summaries)
}

fn view_record(path: &Path) -> Response<Full<Bytes>> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(_) => return text_response(StatusCode::NOT_FOUND, "record not found"),
    };
    match parse_record(&content) {
        Ok(parsed) => json_response(StatusCode::OK, &parsed),
        Err(e) => text_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            &format!("unparseable record: {}", e),
        ),
    }
}

fn download_record(path: &Path) -> Response<Full<Bytes>> {
    match std::fs::read(path) {
        Ok(content) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/octet-stream")
            .body(Full::new(Bytes::from(content)))
            .unwrap(),
        Err(_) => text_response(StatusCode::NOT_FOUND, "record not found"),
    }
}

/// Resolve the `path` query parameter against the output root, rejecting
/// anything that escapes it.
fn record_path_param(output_dir: &Path, query: Option<&str>) -> Option<PathBuf> {
    let raw = query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("path="))?;
    let rel = percent_decode(raw);
    if rel.is_empty() {
        return None;
    }

    let candidate = output_dir.join(&rel);
    let canonical = candidate.canonicalize().ok()?;
    let root = output_dir.canonicalize().ok()?;
    if canonical.starts_with(&root) {
        Some(canonical)
    } else {
        None
    }
}

/// Minimal percent-decoding for the path parameter.
fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3).and_then(|h| {
                    let h = std::str::from_utf8(h).ok()?;
                    u8::from_str_radix(h, 16).ok()
                });
                match hex {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Recursive walk collecting `.http` files.
fn collect_record_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_record_files(&path, out);
        } else if path.extension().map(|e| e == "http").unwrap_or(false) {
            out.push(path);
        }
    }
}

/// Read just the header slot of a record file.
fn read_record_header(path: &Path) -> Result<RecordHeader> {
    let mut slot = vec![0u8; HEADER_LEN];
    let mut file = std::fs::File::open(path)?;
    file.read_exact(&mut slot)?;
    decode_header_block(&slot)
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .unwrap(),
        Err(e) => text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("serialization failed: {}", e),
        ),
    }
}

fn text_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(Full::new(Bytes::from(message.to_string())))
        .unwrap()
}
