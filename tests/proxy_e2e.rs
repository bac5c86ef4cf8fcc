//! End-to-end proxy tests
//!
//! Spins up a canned upstream and the real proxy on loopback ports, drives
//! them with a plain HTTP client, and checks both what the client sees and
//! what lands on disk.

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use llm_tracelab::config::{
    ChaosAction, ChaosRule, ChaosSettings, Config, DebugSettings, MonitorSettings, ServerSettings,
    UpstreamSettings,
};
use llm_tracelab::proxy::ProxyServer;
use llm_tracelab::record::{decode_header_block, RecordHeader, HEADER_LEN};
use llm_tracelab::replay::Transport;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

const NON_STREAM_RES: &str = r#"{"id":"chatcmpl-1","choices":[{"message":{"content":"AI小助手"}}],"usage":{"prompt_tokens":9,"completion_tokens":3,"total_tokens":12}}"#;

const STREAM_RES: &str = concat!(
    "data: {\"choices\":[{\"delta\":{\"content\":\"AI\"}}]}\n\n",
    "data: {\"choices\":[{\"delta\":{\"content\":\"小助手\"}}]}\n\n",
    "data: {\"usage\":{\"prompt_tokens\":9,\"completion_tokens\":5,\"total_tokens\":14}}\n\n",
    "data: [DONE]\n\n",
);

/// What the canned upstream observed, for assertions.
#[derive(Default)]
struct UpstreamState {
    hits: AtomicUsize,
    last_body: Mutex<Option<Vec<u8>>>,
    last_authorization: Mutex<Option<String>>,
}

/// Serve canned OpenAI-shaped responses on a loopback port.
async fn spawn_upstream(state: Arc<UpstreamState>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let state = state.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req: Request<Incoming>| {
                    let state = state.clone();
                    async move {
                        state.hits.fetch_add(1, Ordering::SeqCst);
                        let auth = req
                            .headers()
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .map(String::from);
                        *state.last_authorization.lock().unwrap() = auth;

                        let (parts, body) = req.into_parts();
                        let body = body.collect().await.unwrap().to_bytes();
                        *state.last_body.lock().unwrap() = Some(body.to_vec());

                        Ok::<_, Infallible>(canned_response(parts.uri.path(), &body))
                    }
                });
                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });

    addr
}

fn canned_response(path: &str, body: &[u8]) -> Response<Full<Bytes>> {
    match path {
        "/v1/chat/completions" => {
            let streaming = serde_json::from_slice::<serde_json::Value>(body)
                .ok()
                .and_then(|v| v.get("stream").and_then(|s| s.as_bool()))
                .unwrap_or(false);
            if streaming {
                Response::builder()
                    .status(StatusCode::OK)
                    .header("content-type", "text/event-stream")
                    .body(Full::new(Bytes::from_static(STREAM_RES.as_bytes())))
                    .unwrap()
            } else {
                Response::builder()
                    .status(StatusCode::OK)
                    .header("content-type", "application/json")
                    .header("x-request-id", "mock-1")
                    .body(Full::new(Bytes::from_static(NON_STREAM_RES.as_bytes())))
                    .unwrap()
            }
        }
        _ => Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from_static(br#"{"error":"overloaded"}"#)))
            .unwrap(),
    }
}

/// Bind the proxy on a loopback port and return its base URL.
async fn spawn_proxy(upstream: SocketAddr, output_dir: &Path, chaos: ChaosSettings) -> String {
    let config = Arc::new(Config {
        server: ServerSettings { port: 0 },
        monitor: MonitorSettings { port: None },
        upstream: UpstreamSettings {
            base_url: format!("http://{}", upstream),
            api_key: "sk-upstream".to_string(),
        },
        debug: DebugSettings {
            output_dir: output_dir.to_path_buf(),
            mask_key: true,
        },
        chaos,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = ProxyServer::new(config).unwrap();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    format!("http://{}", addr)
}

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

/// Wait for a record file to appear and be finalized (header back-patched).
async fn wait_for_record(dir: &Path) -> (PathBuf, RecordHeader, Vec<u8>) {
    for _ in 0..200 {
        let mut files = Vec::new();
        collect_record_files(dir, &mut files);
        if let Some(path) = files.first() {
            let content = std::fs::read(path).unwrap_or_default();
            if content.len() >= HEADER_LEN {
                if let Ok(header) = decode_header_block(&content) {
                    if header.meta.status_code != 0 {
                        return (path.clone(), header, content);
                    }
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("record file was not finalized in time");
}

fn no_chaos() -> ChaosSettings {
    ChaosSettings {
        enabled: false,
        rules: Vec::new(),
    }
}

#[tokio::test]
async fn non_stream_chat_round_trip() {
    let state = Arc::new(UpstreamState::default());
    let upstream = spawn_upstream(state.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let proxy = spawn_proxy(upstream, dir.path(), no_chaos()).await;

    let request_body =
        r#"{"model":"qwen3-max","messages":[{"role":"user","content":"用5个字介绍一下自己"}],"max_tokens":10,"stream":false}"#;
    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", proxy))
        .header("content-type", "application/json")
        .header("authorization", "Bearer sk-client")
        .body(request_body)
        .send()
        .await
        .expect("proxy should answer");

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.headers()["x-request-id"], "mock-1");
    let body = response.bytes().await.unwrap();
    assert_eq!(body.as_ref(), NON_STREAM_RES.as_bytes());

    let (path, header, content) = wait_for_record(dir.path()).await;
    assert_eq!(header.meta.model, "qwen3-max");
    assert_eq!(header.meta.status_code, 200);
    assert!(!header.layout.is_stream);
    assert_eq!(header.usage.total_tokens, 12);
    assert_eq!(header.expected_file_len(), content.len() as u64);
    assert_eq!(header.meta.content_length, NON_STREAM_RES.len() as u64);

    // Recorded response bytes are identical to what the client received.
    let body_start = header.response_body_offset() as usize;
    assert_eq!(&content[body_start..], NON_STREAM_RES.as_bytes());

    // The dump is masked; the forwarded request carried the upstream key.
    let dump_end = HEADER_LEN + header.layout.req_header_len as usize;
    let dump = String::from_utf8_lossy(&content[HEADER_LEN..dump_end]);
    assert!(dump.contains("Bearer fake-key-logging"));
    assert_eq!(
        state.last_authorization.lock().unwrap().as_deref(),
        Some("Bearer sk-upstream")
    );

    // And the file replays back the same response.
    let replayed = Transport::new(&path).round_trip().unwrap();
    assert_eq!(replayed.status(), StatusCode::OK);
    assert_eq!(replayed.into_body().bytes().unwrap(), NON_STREAM_RES.as_bytes());
}

#[tokio::test]
async fn stream_chat_injects_usage_and_records_stream() {
    let state = Arc::new(UpstreamState::default());
    let upstream = spawn_upstream(state.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let proxy = spawn_proxy(upstream, dir.path(), no_chaos()).await;

    let request_body = r#"{"model":"qwen3-max","messages":[{"role":"user","content":"用5个字介绍一下自己"}],"stream":true}"#;
    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", proxy))
        .header("content-type", "application/json")
        .body(request_body)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/event-stream");
    let body = response.bytes().await.unwrap();
    assert_eq!(body.as_ref(), STREAM_RES.as_bytes());

    // The forwarded body was rewritten to request the usage chunk.
    let forwarded: serde_json::Value =
        serde_json::from_slice(state.last_body.lock().unwrap().as_ref().unwrap()).unwrap();
    assert_eq!(forwarded["stream_options"]["include_usage"], true);

    let (_, header, content) = wait_for_record(dir.path()).await;
    assert!(header.layout.is_stream);
    assert_eq!(header.usage.total_tokens, 14);
    assert!(header.meta.ttft_ms >= 0);

    let parsed = llm_tracelab::monitor::parse_record(&content).unwrap();
    assert_eq!(parsed.ai_content, "AI小助手");
}

#[tokio::test]
async fn upstream_5xx_passes_through_and_is_recorded() {
    let state = Arc::new(UpstreamState::default());
    let upstream = spawn_upstream(state.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let proxy = spawn_proxy(upstream, dir.path(), no_chaos()).await;

    let response = reqwest::Client::new()
        .post(format!("{}/v1/embeddings", proxy))
        .header("content-type", "application/json")
        .body(r#"{"model":"text-embedding-3","input":"hi"}"#)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.bytes().await.unwrap().as_ref(), br#"{"error":"overloaded"}"#);

    let (_, header, _) = wait_for_record(dir.path()).await;
    assert_eq!(header.meta.status_code, 503);
    assert_eq!(header.usage.total_tokens, 0);
    assert_eq!(header.meta.model, "text-embedding-3");
}

#[tokio::test]
async fn chaos_error_rule_short_circuits_upstream() {
    let state = Arc::new(UpstreamState::default());
    let upstream = spawn_upstream(state.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let chaos = ChaosSettings {
        enabled: true,
        rules: vec![ChaosRule {
            model: "*".to_string(),
            rate: 1.0,
            action: ChaosAction::Error,
            delay: Duration::ZERO,
            status_code: 429,
            message: String::new(),
        }],
    };
    let proxy = spawn_proxy(upstream, dir.path(), chaos).await;

    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", proxy))
        .header("content-type", "application/json")
        .body(r#"{"model":"qwen3-max","messages":[]}"#)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.text().await.unwrap(), "Chaos Injection Error");

    let (_, header, content) = wait_for_record(dir.path()).await;
    assert_eq!(header.meta.status_code, 429);
    assert_eq!(header.expected_file_len(), content.len() as u64);

    // The upstream was never contacted.
    assert_eq!(state.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn chaos_delay_rule_still_forwards() {
    let state = Arc::new(UpstreamState::default());
    let upstream = spawn_upstream(state.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let chaos = ChaosSettings {
        enabled: true,
        rules: vec![ChaosRule {
            model: "*".to_string(),
            rate: 1.0,
            action: ChaosAction::Delay,
            delay: Duration::from_millis(50),
            status_code: 0,
            message: String::new(),
        }],
    };
    let proxy = spawn_proxy(upstream, dir.path(), chaos).await;

    let start = std::time::Instant::now();
    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", proxy))
        .header("content-type", "application/json")
        .body(r#"{"model":"qwen3-max","messages":[],"stream":false}"#)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert_eq!(state.hits.load(Ordering::SeqCst), 1);
}
