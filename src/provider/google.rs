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

/// Adapter for the Gemini API. The API key travels as a `key=` query
/// parameter; there is no authorization header. Gemini streams full
/// response objects per frame and never emits an explicit terminator.
pub struct Google {
    name: String,
    base_url: String,
    api_key: String,
    models: Vec<String>,
    http: reqwest::Client,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest<'a> {
    contents: Vec<GeminiContent<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Serialize)]
struct GeminiContent<'a> {
    role: &'a str,
    parts: Vec<GeminiPart<'a>>,
}

#[derive(Serialize)]
struct GeminiPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct GeminiSystemInstruction<'a> {
    parts: Vec<GeminiPart<'a>>,
}

#[derive(Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: GeminiResponseContent,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Deserialize, Default)]
struct GeminiResponsePart {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    total_token_count: u32,
}

impl From<&GeminiUsage> for Usage {
    fn from(value: &GeminiUsage) -> Self {
        Usage {
            prompt_tokens: value.prompt_token_count,
            completion_tokens: value.candidates_token_count,
            total_tokens: value.total_token_count,
        }
    }
}

fn finish_reason(reason: &str) -> String {
    match reason {
        "STOP" => "stop".to_string(),
        "MAX_TOKENS" => "length".to_string(),
        "SAFETY" => "content_filter".to_string(),
        other => other.to_string(),
    }
}

fn generated_id() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("gen-{nanos}")
}

impl Google {
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

    fn convert_request<'a>(&self, req: &'a ChatRequest) -> GeminiRequest<'a> {
        let config = GenerationConfig {
            temperature: req.temperature,
            top_p: req.top_p,
            max_output_tokens: req.max_tokens,
        };
        let has_config = config.temperature.is_some()
            || config.top_p.is_some()
            || config.max_output_tokens.is_some();

        let mut system_instruction = None;
        let mut contents = Vec::with_capacity(req.messages.len());
        for message in &req.messages {
            if message.role == "system" {
                system_instruction = Some(GeminiSystemInstruction {
                    parts: vec![GeminiPart {
                        text: &message.content,
                    }],
                });
                continue;
            }

            let role = if message.role == "assistant" {
                "model"
            } else {
                &message.role
            };
            contents.push(GeminiContent {
                role,
                parts: vec![GeminiPart {
                    text: &message.content,
                }],
            });
        }

        GeminiRequest {
            contents,
            system_instruction,
            generation_config: has_config.then_some(config),
        }
    }

    fn chat_url(&self, model: &str) -> String {
        format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, model, self.api_key
        )
    }

    fn stream_url(&self, model: &str) -> String {
        format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, model, self.api_key
        )
    }

    async fn post(&self, url: String, body: &GeminiRequest<'_>) -> Result<reqwest::Response> {
        let response = self.http.post(url).json(body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = truncated_body(response).await;
            return Err(ProxyError::Upstream { status, body });
        }
        Ok(response)
    }
}

#[async_trait]
impl Provider for Google {
    fn name(&self) -> &str {
        &self.name
    }

    fn models(&self) -> &[String] {
        &self.models
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let body = self.convert_request(req);
        let response = self.post(self.chat_url(&req.model), &body).await?;
        let parsed = response.json::<GeminiResponse>().await?;

        let mut content = String::new();
        let mut reason = String::new();
        if let Some(candidate) = parsed.candidates.first() {
            if let Some(part) = candidate.content.parts.first() {
                content = part.text.clone();
            }
            reason = finish_reason(candidate.finish_reason.as_deref().unwrap_or_default());
        }

        Ok(ChatResponse {
            id: generated_id(),
            object: "chat.completion".to_string(),
            created: unix_now(),
            model: req.model.clone(),
            choices: vec![Choice {
                index: 0,
                message: Message::new("assistant", content),
                finish_reason: reason,
            }],
            usage: parsed.usage_metadata.as_ref().map(Usage::from).unwrap_or_default(),
        })
    }

    async fn chat_stream(&self, req: &ChatRequest, sw: &dyn SseWriter) -> Result<Option<Usage>> {
        let body = self.convert_request(req);
        let response = self.post(self.stream_url(&req.model), &body).await?;

        let gen_id = generated_id();
        let created = unix_now();
        let mut usage = Usage::default();
        let mut first = true;

        let mut frames = frame_stream(response);
        while let Some(frame) = frames.next().await {
            let frame = frame?;
            let Ok(parsed) = serde_json::from_str::<GeminiResponse>(&frame.data) else {
                continue;
            };

            if let Some(metadata) = parsed.usage_metadata.as_ref() {
                usage = Usage::from(metadata);
            }

            if first {
                first = false;
                let mut role_chunk = ChatStreamChunk::new(&gen_id, created, &req.model);
                role_chunk.choices.push(StreamChoice {
                    index: 0,
                    delta: Delta {
                        role: "assistant".to_string(),
                        content: String::new(),
                    },
                    finish_reason: None,
                });
                write_json(sw, &role_chunk).await?;
            }

            let mut text = String::new();
            let mut reason = None;
            if let Some(candidate) = parsed.candidates.first() {
                if let Some(part) = candidate.content.parts.first() {
                    text = part.text.clone();
                }
                if let Some(raw) = candidate.finish_reason.as_deref().filter(|r| !r.is_empty()) {
                    reason = Some(finish_reason(raw));
                }
            }

            let mut chunk = ChatStreamChunk::new(&gen_id, created, &req.model);
            chunk.choices.push(StreamChoice {
                index: 0,
                delta: Delta {
                    role: String::new(),
                    content: text,
                },
                finish_reason: reason,
            });
            write_json(sw, &chunk).await?;
        }

        // Gemini has no [DONE] marker; signal done once the body ends.
        sw.done().await?;

        Ok(Some(usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse::MemoryWriter;
    use httpmock::Method::POST;
    use httpmock::MockServer;

    fn provider(base_url: String) -> Google {
        Google::new(
            "google",
            base_url,
            "g-key",
            vec!["gemini-pro".to_string()],
        )
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "gemini-pro".to_string(),
            messages: vec![
                Message::new("system", "be brief"),
                Message::new("user", "hello"),
                Message::new("assistant", "hi"),
                Message::new("user", "again"),
            ],
            temperature: Some(0.0),
            max_tokens: Some(64),
            ..Default::default()
        }
    }

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(finish_reason("STOP"), "stop");
        assert_eq!(finish_reason("MAX_TOKENS"), "length");
        assert_eq!(finish_reason("SAFETY"), "content_filter");
        assert_eq!(finish_reason("OTHER"), "OTHER");
    }

    #[test]
    fn convert_request_maps_roles_and_config() {
        let p = provider("http://unused".to_string());
        let req = request();
        let body = p.convert_request(&req);

        assert!(body.system_instruction.is_some());
        assert_eq!(body.contents.len(), 3);
        assert_eq!(body.contents[0].role, "user");
        assert_eq!(body.contents[1].role, "model");
        let config = body.generation_config.expect("config");
        assert_eq!(config.temperature, Some(0.0));
        assert_eq!(config.max_output_tokens, Some(64));
    }

    #[test]
    fn convert_request_omits_empty_generation_config() {
        let p = provider("http://unused".to_string());
        let req = ChatRequest {
            model: "gemini-pro".to_string(),
            messages: vec![Message::new("user", "hi")],
            ..Default::default()
        };
        assert!(p.convert_request(&req).generation_config.is_none());
    }

    #[tokio::test]
    async fn chat_uses_key_query_param_and_maps_response() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/models/gemini-pro:generateContent")
                    .query_param("key", "g-key");
                then.status(200).json_body(serde_json::json!({
                    "candidates": [{
                        "content": {"role": "model", "parts": [{"text": "Hello!"}]},
                        "finishReason": "STOP"
                    }],
                    "usageMetadata": {
                        "promptTokenCount": 6,
                        "candidatesTokenCount": 2,
                        "totalTokenCount": 8
                    }
                }));
            })
            .await;

        let resp = provider(server.base_url()).chat(&request()).await.expect("chat");
        mock.assert_async().await;
        assert_eq!(resp.choices[0].message.content, "Hello!");
        assert_eq!(resp.choices[0].finish_reason, "stop");
        assert_eq!(resp.usage.total_tokens, 8);
        assert!(resp.id.starts_with("gen-"));
    }

    #[tokio::test]
    async fn chat_stream_emits_role_then_content_then_done() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/models/gemini-pro:streamGenerateContent")
                    .query_param("alt", "sse")
                    .query_param("key", "g-key");
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body(concat!(
                        "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hel\"}]}}]}\n\n",
                        "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"lo\"}]},\"finishReason\":\"STOP\"}],\"usageMetadata\":{\"promptTokenCount\":6,\"candidatesTokenCount\":2,\"totalTokenCount\":8}}\n\n",
                    ));
            })
            .await;

        let writer = MemoryWriter::new();
        let usage = provider(server.base_url())
            .chat_stream(&request(), writer.as_ref())
            .await
            .expect("stream")
            .expect("usage");

        assert_eq!(usage.total_tokens, 8);

        let events = writer.events();
        assert_eq!(events.len(), 4);

        let role: ChatStreamChunk = serde_json::from_str(&events[0]).expect("role");
        assert_eq!(role.choices[0].delta.role, "assistant");

        let first: ChatStreamChunk = serde_json::from_str(&events[1]).expect("content");
        assert_eq!(first.choices[0].delta.content, "Hel");
        assert!(first.choices[0].finish_reason.is_none());

        let last: ChatStreamChunk = serde_json::from_str(&events[2]).expect("content");
        assert_eq!(last.choices[0].delta.content, "lo");
        assert_eq!(last.choices[0].finish_reason.as_deref(), Some("stop"));

        assert_eq!(events[3], "[DONE]");
    }
}
