//! Record file parsing for the dashboard
//!
//! Turns a raw `.http` file into the view the dashboard renders: the header
//! metadata, the conversation extracted from the request body, and the
//! assistant output reassembled from the response body (concatenated from
//! delta chunks when the response was streamed).

use crate::error::Result;
use crate::record::{decode_header_block, RecordHeader};
use serde::{Deserialize, Serialize};

/// Fully parsed view of one record file.
#[derive(Debug, Serialize)]
pub struct ParsedRecord {
    pub header: RecordHeader,
    /// Request conversation; embedding and rerank requests are rendered as a
    /// single synthetic user message.
    pub chat_messages: Vec<ChatMessage>,
    /// Assistant content, concatenated across SSE deltas for streams.
    pub ai_content: String,
    /// Assistant reasoning content, where the provider emits it.
    pub ai_reasoning: String,
    /// Raw request region (start-line + headers + body), lossy UTF-8.
    pub req_full: String,
    /// Raw response region (status line + headers + body), lossy UTF-8.
    pub res_full: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool_call_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "type")]
    pub call_type: String,
    #[serde(default)]
    pub function: ToolFunction,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolFunction {
    #[serde(default)]
    pub name: String,
    /// JSON-encoded argument string, as providers emit it.
    #[serde(default)]
    pub arguments: String,
}

/// Request body shapes the dashboard understands: chat, embedding, rerank.
#[derive(Deserialize)]
struct RecordedRequest {
    #[serde(default)]
    messages: Vec<ChatMessage>,
    #[serde(default)]
    input: Option<serde_json::Value>,
    #[serde(default)]
    query: String,
    #[serde(default)]
    documents: Vec<String>,
}

/// Parse a complete record file.
pub fn parse_record(content: &[u8]) -> Result<ParsedRecord> {
    let header = decode_header_block(content)?;

    let total = content.len() as u64;
    let req_start = crate::record::HEADER_LEN as u64;
    let req_end =
        (req_start + header.layout.req_header_len + header.layout.req_body_len).min(total);
    let req_body_start = (req_start + header.layout.req_header_len).min(req_end);
    let req_body = &content[req_body_start as usize..req_end as usize];

    let res_start = (req_end + 1).min(total);
    let res_body_start = (res_start + header.layout.res_header_len).min(total);
    let res_body = &content[res_body_start as usize..];

    let chat_messages = parse_request_messages(req_body);
    let (ai_content, ai_reasoning) = parse_ai_content(res_body, header.layout.is_stream);

    Ok(ParsedRecord {
        header,
        chat_messages,
        ai_content,
        ai_reasoning,
        req_full: String::from_utf8_lossy(&content[req_start as usize..req_end as usize])
            .into_owned(),
        res_full: String::from_utf8_lossy(&content[res_start as usize..]).into_owned(),
    })
}

/// Chat messages when present; embedding and rerank inputs are folded into a
/// synthetic user message so every record renders the same way.
fn parse_request_messages(body: &[u8]) -> Vec<ChatMessage> {
    let Ok(request) = serde_json::from_slice::<RecordedRequest>(body) else {
        return Vec::new();
    };

    if !request.messages.is_empty() {
        return request.messages;
    }

    if let Some(input) = request.input {
        return vec![synthetic_user_message(format!(
            "Embedding input:\n{}",
            format_embedding_input(&input)
        ))];
    }

    if !request.query.is_empty() {
        let documents: Vec<String> = request
            .documents
            .iter()
            .map(|d| format!("- {}", d))
            .collect();
        return vec![synthetic_user_message(format!(
            "Rerank query: {}\n\nDocuments:\n{}",
            request.query,
            documents.join("\n")
        ))];
    }

    Vec::new()
}

fn synthetic_user_message(content: String) -> ChatMessage {
    ChatMessage {
        role: "user".to_string(),
        content,
        tool_calls: Vec::new(),
        tool_call_id: String::new(),
        name: String::new(),
    }
}

/// Embedding `input` may be a string or an array of strings.
fn format_embedding_input(input: &serde_json::Value) -> String {
    match input {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_str())
            .map(|s| format!("- {}", s))
            .collect::<Vec<_>>()
            .join("\n"),
        other => serde_json::to_string_pretty(other).unwrap_or_default(),
    }
}

#[derive(Deserialize)]
struct NonStreamResponse {
    #[serde(default)]
    choices: Vec<NonStreamChoice>,
}

#[derive(Deserialize)]
struct NonStreamChoice {
    #[serde(default)]
    message: ResponseMessage,
}

#[derive(Deserialize, Default)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: DeltaMessage,
}

#[derive(Deserialize, Default)]
struct DeltaMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

/// `(content, reasoning)` reassembled from the recorded response body.
fn parse_ai_content(body: &[u8], is_stream: bool) -> (String, String) {
    if body.is_empty() {
        return (String::new(), String::new());
    }

    if !is_stream {
        if let Ok(response) = serde_json::from_slice::<NonStreamResponse>(body) {
            if let Some(choice) = response.choices.into_iter().next() {
                return (
                    choice.message.content.unwrap_or_default(),
                    choice.message.reasoning_content.unwrap_or_default(),
                );
            }
        }
        return (String::new(), String::new());
    }

    let mut content = String::new();
    let mut reasoning = String::new();
    for line in body.split(|&b| b == b'\n') {
        let line = String::from_utf8_lossy(line);
        let line = line.trim();
        let Some(payload) = line.strip_prefix("data:") else {
            continue;
        };
        let payload = payload.trim();
        if payload == "[DONE]" {
            continue;
        }
        if let Ok(chunk) = serde_json::from_str::<StreamChunk>(payload) {
            if let Some(choice) = chunk.choices.into_iter().next() {
                if let Some(delta) = choice.delta.content {
                    content.push_str(&delta);
                }
                if let Some(delta) = choice.delta.reasoning_content {
                    reasoning.push_str(&delta);
                }
            }
        }
    }
    (content, reasoning)
}
