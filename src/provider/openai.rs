use async_trait::async_trait;
use futures_util::StreamExt;

use super::Provider;

use crate::embedding::truncated_body;
use crate::error::{ProxyError, Result};
use crate::sse::SseWriter;
use crate::types::{ChatRequest, ChatResponse, ChatStreamChunk, StreamOptions, Usage};
use crate::utils::http_client;
use crate::utils::sse::frame_stream;

/// Adapter for upstreams that already speak the canonical OpenAI
/// chat-completions dialect; requests are forwarded with only the stream
/// flags adjusted, and streamed chunks are relayed raw.
pub struct OpenAiCompat {
    name: String,
    base_url: String,
    api_key: String,
    models: Vec<String>,
    http: reqwest::Client,
}

impl OpenAiCompat {
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

    async fn post_completions(&self, body: &ChatRequest) -> Result<reqwest::Response> {
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
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
impl Provider for OpenAiCompat {
    fn name(&self) -> &str {
        &self.name
    }

    fn models(&self) -> &[String] {
        &self.models
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let mut body = req.clone();
        body.stream = false;
        body.stream_options = None;

        let response = self.post_completions(&body).await?;
        Ok(response.json::<ChatResponse>().await?)
    }

    async fn chat_stream(&self, req: &ChatRequest, sw: &dyn SseWriter) -> Result<Option<Usage>> {
        let mut body = req.clone();
        body.stream = true;
        body.stream_options = Some(StreamOptions {
            include_usage: true,
        });

        let response = self.post_completions(&body).await?;

        let mut usage: Option<Usage> = None;
        let mut frames = frame_stream(response);
        while let Some(frame) = frames.next().await {
            let frame = frame?;
            if frame.is_done() {
                sw.done().await?;
                break;
            }

            // The payload is already canonical; only chunks that mention
            // usage (typically the final one) are worth parsing.
            if frame.data.contains("\"usage\"") {
                if let Ok(chunk) = serde_json::from_str::<ChatStreamChunk>(&frame.data) {
                    if chunk.usage.is_some() {
                        usage = chunk.usage;
                    }
                }
            }

            sw.write_event(frame.data.as_bytes()).await?;
        }

        Ok(usage)
    }
}
