//! Reverse proxy pipeline
//!
//! One request passes through stream-options injection, record file
//! preparation, chaos evaluation, and the upstream round-trip. Response
//! bytes are streamed, never buffered; the same bytes, in the same order, go
//! to the client and to the record file through a single read path. The
//! header slot is back-patched exactly once, after the body is drained.

mod inject;
mod instrument;
mod sniffer;

pub use inject::ensure_stream_options;
pub use instrument::ResponseMeter;
pub use sniffer::UsageSniffer;

use crate::chaos::ChaosEngine;
use crate::config::{ChaosAction, Config};
use crate::error::Result;
use crate::record::{LogInfo, Recorder};
use bytes::Bytes;
use futures::StreamExt;
use http::header::{
    ACCEPT_ENCODING, AUTHORIZATION, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST,
    TRANSFER_ENCODING,
};
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode, Version};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Body type for responses to the client: either a buffered error message or
/// the live upstream stream.
type ResponseBody = BoxBody<Bytes, Infallible>;

/// Channel capacity between the upstream copy task and the client body.
const STREAM_CHANNEL_CAPACITY: usize = 32;

/// The recording reverse proxy.
pub struct ProxyServer {
    config: Arc<Config>,
    recorder: Arc<Recorder>,
    chaos: ChaosEngine,
    client: reqwest::Client,
}

impl ProxyServer {
    pub fn new(config: Arc<Config>) -> Result<Arc<Self>> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()?;

        let recorder = Arc::new(Recorder::new(
            config.debug.output_dir.clone(),
            config.debug.mask_key,
        ));
        let chaos = ChaosEngine::new(config.chaos.clone());

        Ok(Arc::new(Self {
            config,
            recorder,
            chaos,
            client,
        }))
    }

    /// Bind the configured port and serve until the process exits.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let addr: SocketAddr = ([0, 0, 0, 0], self.config.server.port).into();
        let listener = TcpListener::bind(addr).await?;
        info!(
            "Proxy listening on {} (upstream {})",
            addr, self.config.upstream.base_url
        );
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req: Request<Incoming>| {
                    let server = server.clone();
                    async move { Ok::<_, Infallible>(server.handle(req, peer).await) }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("Proxy connection error: {}", e);
                }
            });
        }
    }

    /// The full per-request pipeline.
    async fn handle(self: Arc<Self>, req: Request<Incoming>, peer: SocketAddr) -> Response<ResponseBody> {
        let mut meter = ResponseMeter::new();
        let client_ip = peer.to_string();

        // LLM request bodies are small; buffer once and share the bytes
        // between the injector, the recorder, and the upstream call.
        let (mut parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                error!("Failed to read request body: {}", e);
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to read request body",
                );
            }
        };

        let body = match ensure_stream_options(&parts.method, &parts.headers, &body) {
            Some(rewritten) => {
                parts
                    .headers
                    .insert(CONTENT_LENGTH, HeaderValue::from(rewritten.len()));
                rewritten
            }
            None => body,
        };

        // Recording setup failures reject the request: proxying without a
        // record would defeat the point of the system.
        let mut log = match self.recorder.prepare_log_file(
            &parts,
            &body,
            &client_ip,
            &self.config.upstream.base_url,
        ) {
            Ok(log) => log,
            Err(e) => {
                error!("Failed to prepare record file: {}", e);
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Logging Error");
            }
        };

        if let Some(injection) = self.chaos.evaluate(&log.header.meta.model) {
            match injection.action {
                ChaosAction::Error => {
                    return self.respond_locally(
                        log,
                        meter,
                        injection.status,
                        Bytes::from(injection.message),
                        Some("chaos injection"),
                    );
                }
                ChaosAction::Delay => tokio::time::sleep(injection.delay).await,
            }
        }

        let upstream = match self.forward(&parts, body).await {
            Ok(response) => response,
            Err(e) => {
                error!("Proxy error: {}", e);
                log.header.meta.error = Some(e.to_string());
                return self.respond_locally(
                    log,
                    meter,
                    StatusCode::BAD_GATEWAY,
                    Bytes::from(format!("Proxy Error: {}", e)),
                    None,
                );
            }
        };

        let status = upstream.status();
        let version = upstream.version();
        let res_headers = upstream.headers().clone();
        meter.set_status(status);

        log.append_delimiter();
        log.append_response_head(version, status, &res_headers);
        let is_stream = response_is_stream(&res_headers);
        log.header.layout.is_stream = is_stream;

        let (tx, rx) = mpsc::channel::<Bytes>(STREAM_CHANNEL_CAPACITY);
        let recorder = self.recorder.clone();
        let upstream_body = upstream.bytes_stream();

        // The copy task owns the record session: it fans each chunk out to
        // the file, the sniffer, and the client, then back-patches the
        // header once the body is drained.
        tokio::spawn(async move {
            let mut stream = Box::pin(upstream_body);
            let mut sniffer = UsageSniffer::new(is_stream);

            while let Some(next) = stream.next().await {
                match next {
                    Ok(chunk) => {
                        meter.observe_write(chunk.len());
                        log.append_body_chunk(&chunk);
                        sniffer.observe(&chunk);
                        if tx.send(chunk).await.is_err() {
                            // Client went away; stop pulling from upstream
                            // and finalize with what was captured.
                            log.header.meta.error = Some("client disconnected".to_string());
                            break;
                        }
                    }
                    Err(e) => {
                        log.header.meta.error = Some(e.to_string());
                        break;
                    }
                }
            }

            log.header.usage = sniffer.finish();
            finalize(&recorder, &mut log, &meter);
        });

        let mut builder = Response::builder().status(status);
        for (name, value) in &res_headers {
            if name == TRANSFER_ENCODING || name == CONNECTION {
                continue;
            }
            builder = builder.header(name, value);
        }
        let body = BodyExt::boxed(StreamBody::new(ChannelBody { rx }));
        builder
            .body(body)
            .unwrap_or_else(|e| error_response(StatusCode::BAD_GATEWAY, &e.to_string()))
    }

    /// Send the buffered request to the upstream provider.
    async fn forward(
        &self,
        parts: &http::request::Parts,
        body: Bytes,
    ) -> std::result::Result<reqwest::Response, reqwest::Error> {
        let url = self.upstream_url(parts);

        let mut headers = parts.headers.clone();
        headers.remove(HOST);
        headers.remove(CONTENT_LENGTH);
        headers.remove(TRANSFER_ENCODING);
        headers.remove(CONNECTION);
        // Identity keeps the recorded response body uncompressed.
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        if !self.config.upstream.api_key.is_empty() {
            if let Ok(value) =
                HeaderValue::from_str(&format!("Bearer {}", self.config.upstream.api_key))
            {
                headers.insert(AUTHORIZATION, value);
            }
        }

        self.client
            .request(parts.method.clone(), url)
            .headers(headers)
            .body(body)
            .send()
            .await
    }

    /// Single-host rewrite: the upstream base path is prefixed onto the
    /// request path, query preserved.
    fn upstream_url(&self, parts: &http::request::Parts) -> String {
        let base = self.config.upstream.base_url.trim_end_matches('/');
        let path = parts.uri.path();
        match parts.uri.query() {
            Some(query) => format!("{}{}?{}", base, path, query),
            None => format!("{}{}", base, path),
        }
    }

    /// Answer the client from the proxy itself (chaos error, upstream
    /// failure), recording the synthesized response so the file stays
    /// complete and parseable.
    fn respond_locally(
        &self,
        mut log: LogInfo,
        mut meter: ResponseMeter,
        status: StatusCode,
        message: Bytes,
        error_note: Option<&str>,
    ) -> Response<ResponseBody> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(message.len()));

        log.append_delimiter();
        log.append_response_head(Version::HTTP_11, status, &headers);
        log.append_body_chunk(&message);
        if let Some(note) = error_note {
            log.header.meta.error = Some(note.to_string());
        }

        meter.set_status(status);
        meter.observe_write(message.len());
        finalize(&self.recorder, &mut log, &meter);

        let mut builder = Response::builder().status(status);
        for (name, value) in &headers {
            builder = builder.header(name, value);
        }
        builder
            .body(Full::new(message).boxed())
            .unwrap_or_else(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))
    }
}

/// Back-patch the header slot with the final metrics and close the file.
fn finalize(recorder: &Recorder, log: &mut LogInfo, meter: &ResponseMeter) {
    log.header.meta.status_code = meter.status().as_u16();
    log.header.meta.duration_ms = meter.elapsed_ms();
    log.header.meta.ttft_ms = meter.ttft_ms();
    log.header.meta.content_length = meter.bytes_written();

    if let Err(e) = recorder.update_log_file(log) {
        error!(path = %log.path.display(), "Failed to finalize record file: {}", e);
    }

    info!(
        model = %log.header.meta.model,
        status = log.header.meta.status_code,
        tokens_total = log.header.usage.total_tokens,
        "request completed"
    );
}

/// A response is treated as a stream when the upstream marks it as SSE or
/// uses chunked transfer.
fn response_is_stream(headers: &HeaderMap) -> bool {
    let sse = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/event-stream"))
        .unwrap_or(false);
    let chunked = headers
        .get(TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);
    sse || chunked
}

/// Client-facing body fed by the upstream copy task.
struct ChannelBody {
    rx: mpsc::Receiver<Bytes>,
}

impl futures::Stream for ChannelBody {
    type Item = std::result::Result<Frame<Bytes>, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.get_mut().rx.poll_recv(cx) {
            Poll::Ready(Some(bytes)) => Poll::Ready(Some(Ok(Frame::data(bytes)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from(message.to_string())).boxed())
        .unwrap()
}
