use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};
use crate::types::Message;
use crate::utils::http_client;

/// Client for an OpenAI-compatible embeddings endpoint.
#[derive(Clone)]
pub struct EmbeddingClient {
    base_url: String,
    api_key: String,
    model: String,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a str,
    model: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    embedding: Vec<f32>,
}

impl EmbeddingClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            http: http_client(100),
        }
    }

    /// Returns the dense vector for the given text.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = EmbeddingRequest {
            input: text,
            model: &self.model,
        };

        let response = self
            .http
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = truncated_body(response).await;
            return Err(ProxyError::Upstream { status, body });
        }

        let mut parsed = response.json::<EmbeddingResponse>().await?;
        let Some(first) = parsed.data.first_mut().filter(|d| !d.embedding.is_empty()) else {
            return Err(ProxyError::InvalidResponse(
                "empty embedding response".to_string(),
            ));
        };
        Ok(std::mem::take(&mut first.embedding))
    }
}

pub(crate) async fn truncated_body(response: reqwest::Response) -> String {
    let mut body = response.text().await.unwrap_or_default();
    body.truncate(4096);
    body
}

/// Canonical text fed to the embedder: `role: content` lines joined with
/// newlines. Seed and lookup must agree on this; changing it invalidates
/// all prior vectors.
pub fn text_from_messages(messages: &[Message]) -> String {
    let mut out = String::new();
    for (i, message) in messages.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(&message.role);
        out.push_str(": ");
        out.push_str(&message.content);
    }
    out
}
