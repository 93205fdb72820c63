use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use super::Provider;
use crate::embedding::truncated_body;
use crate::error::{ProxyError, Result};
use crate::sse::{SseWriter, write_json};
use crate::types::{
    ChatRequest, ChatResponse, ChatStreamChunk, Choice, Delta, Message, StreamChoice, Usage,
    unix_now,
};
use crate::utils::http_client;
use crate::utils::sse::frame_stream;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Adapter for the Anthropic Messages API. The single system message (if
/// any) becomes the top-level `system` field; streamed typed events are
/// re-emitted as canonical chunks.
pub struct Anthropic {
    name: String,
    base_url: String,
    api_key: String,
    models: Vec<String>,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    stream: bool,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize, Default)]
struct MessagesResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    model: String,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: ApiUsage,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Default)]
struct ApiUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Deserialize)]
struct MessageStartEvent {
    message: MessagesResponse,
}

#[derive(Deserialize)]
struct ContentBlockDeltaEvent {
    delta: DeltaContent,
}

#[derive(Deserialize, Default)]
struct DeltaContent {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct MessageDeltaEvent {
    #[serde(default)]
    delta: MessageDeltaInner,
    #[serde(default)]
    usage: DeltaUsage,
}

#[derive(Deserialize, Default)]
struct MessageDeltaInner {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct DeltaUsage {
    #[serde(default)]
    output_tokens: u32,
}

fn finish_reason(stop_reason: Option<&str>) -> String {
    match stop_reason {
        Some("end_turn") | Some("stop_sequence") => "stop".to_string(),
        Some("max_tokens") => "length".to_string(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

impl Anthropic {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        models: Vec<String>,
    ) -> Self {
        let base_url = base_url.into();
        Self {
            name: name.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            models,
            http: http_client(1000),
        }
    }

    fn convert_request<'a>(&self, req: &'a ChatRequest, stream: bool) -> MessagesRequest<'a> {
        let mut system = None;
        let mut messages = Vec::with_capacity(req.messages.len());
        for message in &req.messages {
            if message.role == "system" {
                system = Some(message.content.as_str());
                continue;
            }
            messages.push(ApiMessage {
                role: &message.role,
                content: &message.content,
            });
        }

        MessagesRequest {
            model: &req.model,
            messages,
            system,
            max_tokens: req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: req.temperature,
            top_p: req.top_p,
            stream,
        }
    }

    async fn post_messages(&self, body: &MessagesRequest<'_>) -> Result<reqwest::Response> {
        let response = self
            .http
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = truncated_body(response).await;
            return Err(ProxyError::Upstream { status, body });
        }
        Ok(response)
    }
}

#[async_trait]
impl Provider for Anthropic {
    fn name(&self) -> &str {
        &self.name
    }

    fn models(&self) -> &[String] {
        &self.models
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let body = self.convert_request(req, false);
        let response = self.post_messages(&body).await?;
        let parsed = response.json::<MessagesResponse>().await?;

        let content: String = parsed
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .map(|block| block.text.as_str())
            .collect();

        Ok(ChatResponse {
            id: parsed.id,
            object: "chat.completion".to_string(),
            created: unix_now(),
            model: parsed.model,
            choices: vec![Choice {
                index: 0,
                message: Message::new("assistant", content),
                finish_reason: finish_reason(parsed.stop_reason.as_deref()),
            }],
            usage: Usage {
                prompt_tokens: parsed.usage.input_tokens,
                completion_tokens: parsed.usage.output_tokens,
                total_tokens: parsed.usage.input_tokens + parsed.usage.output_tokens,
            },
        })
    }

    async fn chat_stream(&self, req: &ChatRequest, sw: &dyn SseWriter) -> Result<Option<Usage>> {
        let body = self.convert_request(req, true);
        let response = self.post_messages(&body).await?;

        let mut usage = Usage::default();
        let mut msg_id = String::new();
        let mut model_name = String::new();

        let mut frames = frame_stream(response);
        while let Some(frame) = frames.next().await {
            let frame = frame?;
            match frame.event.as_deref() {
                Some("message_start") => {
                    let Ok(event) = serde_json::from_str::<MessageStartEvent>(&frame.data) else {
                        continue;
                    };
                    msg_id = event.message.id;
                    model_name = event.message.model;
                    usage.prompt_tokens = event.message.usage.input_tokens;

                    let mut chunk = ChatStreamChunk::new(&msg_id, unix_now(), &model_name);
                    chunk.choices.push(StreamChoice {
                        index: 0,
                        delta: Delta {
                            role: "assistant".to_string(),
                            content: String::new(),
                        },
                        finish_reason: None,
                    });
                    write_json(sw, &chunk).await?;
                }
                Some("content_block_delta") => {
                    let Ok(event) = serde_json::from_str::<ContentBlockDeltaEvent>(&frame.data)
                    else {
                        continue;
                    };

                    let mut chunk = ChatStreamChunk::new(&msg_id, unix_now(), &model_name);
                    chunk.choices.push(StreamChoice {
                        index: 0,
                        delta: Delta {
                            role: String::new(),
                            content: event.delta.text,
                        },
                        finish_reason: None,
                    });
                    write_json(sw, &chunk).await?;
                }
                Some("message_delta") => {
                    let Ok(event) = serde_json::from_str::<MessageDeltaEvent>(&frame.data) else {
                        continue;
                    };
                    usage.completion_tokens = event.usage.output_tokens;
                    usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;

                    let mut chunk = ChatStreamChunk::new(&msg_id, unix_now(), &model_name);
                    chunk.choices.push(StreamChoice {
                        index: 0,
                        delta: Delta::default(),
                        finish_reason: Some(finish_reason(event.delta.stop_reason.as_deref())),
                    });
                    write_json(sw, &chunk).await?;
                }
                Some("message_stop") => {
                    sw.done().await?;
                }
                // content_block_start, content_block_stop, ping.
                _ => {}
            }
        }

        Ok(Some(usage))
    }
}
