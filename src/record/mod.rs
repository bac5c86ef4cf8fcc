//! On-disk record file format
//!
//! Every proxied request produces exactly one self-describing `.http` file:
//!
//! ```text
//! [0 .. 2048)        header slot: JSON + space padding, byte 2047 is '\n'
//! [2048 .. +reqH)    dumped request start-line + headers + CRLF
//! [.. +reqB)         raw request body bytes
//! [.. +1)            single '\n' delimiter
//! [.. +resH)         dumped response status line + headers + CRLF
//! [.. EOF)           raw response body bytes
//! ```
//!
//! The header slot is written twice: as pure padding when the file is
//! created, and with the serialized [`RecordHeader`] when the request
//! completes. The fixed slot size allows back-patching without touching the
//! body regions.

mod recorder;

pub use recorder::{LogInfo, Recorder};

use crate::error::{Result, TraceLabError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed size of the header slot at the start of every record file.
pub const HEADER_LEN: usize = 2048;

/// Format version tag stored in the header.
pub const FORMAT_VERSION: &str = "LLM_PROXY_V2";

/// Cache-hit breakdown of the prompt tokens, when the provider reports one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTokensDetails {
    #[serde(default)]
    pub cached_tokens: u64,
}

/// Token accounting reported by the provider.
///
/// Mutated monotonically while sniffing: a value is only overwritten by a
/// later observation carrying `total_tokens > 0` (the final SSE usage chunk
/// wins).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageInfo {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens_details: Option<PromptTokensDetails>,
}

/// Byte lengths of the file regions following the header slot.
///
/// The single `\n` delimiter between request body and response head is fixed
/// at one byte and not recorded here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutInfo {
    #[serde(default)]
    pub req_header_len: u64,
    #[serde(default)]
    pub req_body_len: u64,
    #[serde(default)]
    pub res_header_len: u64,
    #[serde(default)]
    pub res_body_len: u64,
    #[serde(default)]
    pub is_stream: bool,
}

/// Request metadata captured in the header.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetaData {
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub duration_ms: i64,
    /// Milliseconds to the first byte written to the client; -1 when no byte
    /// was ever written.
    #[serde(default)]
    pub ttft_ms: i64,
    #[serde(default)]
    pub client_ip: String,
    /// Total bytes written to the client.
    #[serde(default)]
    pub content_length: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Complete metadata stored in the back-patched header slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordHeader {
    pub version: String,
    #[serde(default)]
    pub meta: MetaData,
    #[serde(default)]
    pub layout: LayoutInfo,
    #[serde(default)]
    pub usage: UsageInfo,
}

impl RecordHeader {
    /// Byte offset of the dumped response head (status line + headers).
    pub fn response_offset(&self) -> u64 {
        HEADER_LEN as u64 + self.layout.req_header_len + self.layout.req_body_len + 1
    }

    /// Byte offset of the raw response body.
    pub fn response_body_offset(&self) -> u64 {
        self.response_offset() + self.layout.res_header_len
    }

    /// Total file length implied by the layout fields.
    pub fn expected_file_len(&self) -> u64 {
        self.response_body_offset() + self.layout.res_body_len
    }
}

/// A header slot containing only padding: spaces with a terminal newline.
///
/// Written at file creation so the body regions can be appended immediately;
/// the slot is rewritten with real content by the finalization pass.
pub fn padding_block() -> Vec<u8> {
    let mut block = vec![b' '; HEADER_LEN];
    block[HEADER_LEN - 1] = b'\n';
    block
}

/// Serialize a header into a fixed [`HEADER_LEN`] block.
///
/// The JSON is padded with spaces up to byte 2046 and terminated with `\n` at
/// byte 2047. Serializations longer than 2047 bytes are truncated byte-wise;
/// the slot stays region-addressable even if the JSON no longer parses.
pub fn encode_header_block(header: &RecordHeader) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(header).map_err(|e| TraceLabError::Record(e.to_string()))?;

    let mut block = vec![b' '; HEADER_LEN];
    let len = json.len().min(HEADER_LEN - 1);
    block[..len].copy_from_slice(&json[..len]);
    block[HEADER_LEN - 1] = b'\n';
    Ok(block)
}

/// Parse a header out of the first [`HEADER_LEN`] bytes of a record file.
///
/// Fails if the slot is short, carries no newline, or the JSON prefix does
/// not decode.
pub fn decode_header_block(block: &[u8]) -> Result<RecordHeader> {
    if block.len() < HEADER_LEN {
        return Err(TraceLabError::Record(format!(
            "header slot too short: {} bytes",
            block.len()
        )));
    }
    let slot = &block[..HEADER_LEN];
    let newline = slot
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| TraceLabError::Record("header slot has no newline".to_string()))?;

    serde_json::from_slice(&slot[..newline])
        .map_err(|e| TraceLabError::Record(format!("invalid header json: {}", e)))
}
