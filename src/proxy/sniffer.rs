//! Token usage sniffing
//!
//! Sits in the single read path of the upstream response body and extracts
//! `usage` while the bytes are proxied, without ever buffering the full
//! body. Two parsers cover the two response shapes:
//!
//! - **SSE stream**: a line buffer capped at 64 KiB, scanning complete
//!   `data:` lines for a usage-bearing chunk; the last one observed wins.
//! - **Single JSON document**: a rolling tail of the final 4 KiB, scanned
//!   once at end-of-body for the `"usage"` object.

use crate::record::UsageInfo;
use serde::Deserialize;

/// Cap on the SSE line buffer; a pathological single line keeps only its
/// trailing bytes.
const STREAM_BUF_MAX: usize = 64 * 1024;

/// Size of the rolling tail kept for the non-stream scan.
const TAIL_BUF_MAX: usize = 4096;

#[derive(Deserialize)]
struct UsageChunk {
    usage: Option<UsageInfo>,
}

/// Extracts token usage from response bytes as they flow through the proxy.
pub struct UsageSniffer {
    is_stream: bool,
    usage: UsageInfo,
    line_buf: Vec<u8>,
    tail_buf: Vec<u8>,
}

impl UsageSniffer {
    pub fn new(is_stream: bool) -> Self {
        Self {
            is_stream,
            usage: UsageInfo::default(),
            line_buf: Vec::new(),
            tail_buf: Vec::new(),
        }
    }

    /// Feed one chunk of the response body, in arrival order.
    pub fn observe(&mut self, chunk: &[u8]) {
        if self.is_stream {
            self.observe_stream(chunk);
        } else {
            self.observe_tail(chunk);
        }
    }

    /// Finalize: the non-stream shape is only parseable once the whole body
    /// has passed, so the tail scan runs here. Returns the extracted usage
    /// (all zeros when nothing was observed).
    pub fn finish(mut self) -> UsageInfo {
        if !self.is_stream && self.usage.total_tokens == 0 {
            extract_usage_from_tail(&self.tail_buf, &mut self.usage);
        }
        self.usage
    }

    fn observe_stream(&mut self, chunk: &[u8]) {
        self.line_buf.extend_from_slice(chunk);

        if self.line_buf.len() > STREAM_BUF_MAX {
            let start = self.line_buf.len() - STREAM_BUF_MAX;
            self.line_buf.drain(..start);
        }

        while let Some(idx) = self.line_buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.line_buf.drain(..=idx).collect();
            let line = &line[..line.len() - 1];

            // Fast reject before any allocation or JSON work.
            if find_subslice(line, b"\"usage\"").is_none() {
                continue;
            }
            let Some(rest) = line.strip_prefix(b"data:") else {
                continue;
            };
            let payload = trim_ascii(rest);
            if payload == b"[DONE]" {
                continue;
            }

            if let Ok(parsed) = serde_json::from_slice::<UsageChunk>(payload) {
                if let Some(usage) = parsed.usage {
                    if usage.total_tokens > 0 {
                        self.usage = usage;
                    }
                }
            }
        }
    }

    fn observe_tail(&mut self, chunk: &[u8]) {
        self.tail_buf.extend_from_slice(chunk);
        if self.tail_buf.len() > TAIL_BUF_MAX {
            let start = self.tail_buf.len() - TAIL_BUF_MAX;
            self.tail_buf.drain(..start);
        }
    }
}

/// Scan backwards from the last `"usage"` occurrence, brace-match the object
/// that follows, and decode it. Only overwrites the target when the decoded
/// object carries `total_tokens > 0`.
///
/// Brace matching ignores string content; usage objects hold only numbers,
/// so a `}` inside a string is not a practical concern.
fn extract_usage_from_tail(data: &[u8], target: &mut UsageInfo) {
    let Some(idx) = rfind_subslice(data, b"\"usage\"") else {
        return;
    };
    let segment = &data[idx..];
    let Some(open) = segment.iter().position(|&b| b == b'{') else {
        return;
    };
    let object = &segment[open..];

    let mut depth = 0usize;
    let mut end = None;
    for (i, &b) in object.iter().enumerate() {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(i + 1);
                    break;
                }
            }
            _ => {}
        }
    }

    let Some(end) = end else {
        return;
    };
    if let Ok(usage) = serde_json::from_slice::<UsageInfo>(&object[..end]) {
        if usage.total_tokens > 0 {
            *target = usage;
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn rfind_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

fn trim_ascii(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if first.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = bytes {
        if last.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    bytes
}
