use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single chat message. Role is one of `system`, `user`, `assistant`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Controls streaming behavior of OpenAI-compatible upstreams.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamOptions {
    pub include_usage: bool,
}

/// Mirrors the OpenAI chat completions request. Optional scalar fields
/// distinguish absent from zero; the distinction drives cache gating.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// Token usage. `total_tokens = prompt + completion` whenever both are known.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: Message,
    pub finish_reason: String,
}

/// Mirrors the OpenAI chat completions response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Usage,
}

/// Incremental content in a streaming chunk. An empty delta serializes
/// as `{}` (the terminal-chunk shape).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamChoice {
    pub index: u32,
    pub delta: Delta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Mirrors an OpenAI streaming chunk. At most one chunk in a well-formed
/// stream carries a non-empty `finish_reason`; the terminal chunk may also
/// carry the stream's usage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatStreamChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<StreamChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatStreamChunk {
    pub fn new(id: impl Into<String>, created: i64, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: model.into(),
            choices: Vec::new(),
            usage: None,
        }
    }
}

/// Wraps a ChatRequest with proxy-side metadata.
///
/// `input_tokens` is a coarse estimate used only to set the streaming
/// `X-Tokens-Input` header before upstream usage is known.
#[derive(Clone, Debug)]
pub struct ProxyRequest {
    pub chat: ChatRequest,
    pub request_id: String,
    pub received_at: Instant,
    pub input_tokens: u32,
    pub api_key: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
        }
    }
}

/// Wraps the outcome of a pipeline run. For streaming calls `chat_response`
/// may be `None`; the scalar fields feed the trailing log entry.
#[derive(Clone, Debug)]
pub struct ProxyResponse {
    pub chat_response: Option<ChatResponse>,
    pub output_tokens: u32,
    pub cost: f64,
    pub cache_status: CacheStatus,
    pub provider_name: String,
}

/// OpenAI-compatible error body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorResponse {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                message: message.into(),
                kind: kind.into(),
                code: None,
            },
        }
    }
}

/// Seconds since the Unix epoch, for `created` timestamps.
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_request_defaults_absent_fields_to_none() {
        let req: ChatRequest =
            serde_json::from_str(r#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}]}"#)
                .expect("parse");
        assert_eq!(req.model, "gpt-4o");
        assert!(req.temperature.is_none());
        assert!(!req.stream);
    }

    #[test]
    fn zero_temperature_is_distinct_from_absent() {
        let req: ChatRequest =
            serde_json::from_str(r#"{"model":"m","messages":[],"temperature":0}"#).expect("parse");
        assert_eq!(req.temperature, Some(0.0));
    }

    #[test]
    fn empty_delta_serializes_as_empty_object() {
        let delta = Delta::default();
        assert_eq!(serde_json::to_string(&delta).expect("serialize"), "{}");
    }

    #[test]
    fn stream_chunk_omits_missing_usage_and_finish_reason() {
        let mut chunk = ChatStreamChunk::new("id-1", 0, "gpt-4o");
        chunk.choices.push(StreamChoice {
            index: 0,
            delta: Delta {
                role: "assistant".to_string(),
                content: String::new(),
            },
            finish_reason: None,
        });
        let json = serde_json::to_string(&chunk).expect("serialize");
        assert!(!json.contains("usage"));
        assert!(!json.contains("finish_reason"));
        assert!(!json.contains("\"content\""));
    }
}
