use std::sync::Arc;

use async_trait::async_trait;

use super::{Stage, StreamStage};
use crate::error::Result;
use crate::pricing;
use crate::provider::Registry;
use crate::sse::SseWriter;
use crate::types::{CacheStatus, ProxyRequest, ProxyResponse};

/// Selects a provider by model name and delegates. Always the final stage.
pub struct DispatchStage {
    registry: Arc<Registry>,
}

impl DispatchStage {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Stage for DispatchStage {
    fn name(&self) -> &'static str {
        "dispatch"
    }

    async fn process(&self, req: &ProxyRequest) -> Result<Option<ProxyResponse>> {
        let provider = self.registry.lookup(&req.chat.model)?;
        let chat_response = provider.chat(&req.chat).await?;

        let output_tokens = chat_response.usage.completion_tokens;
        let cost = pricing::calculate(
            &req.chat.model,
            chat_response.usage.prompt_tokens,
            output_tokens,
        );

        Ok(Some(ProxyResponse {
            chat_response: Some(chat_response),
            output_tokens,
            cost,
            cache_status: CacheStatus::Miss,
            provider_name: provider.name().to_string(),
        }))
    }
}

#[async_trait]
impl StreamStage for DispatchStage {
    fn name(&self) -> &'static str {
        "dispatch"
    }

    async fn process_stream(
        &self,
        req: &ProxyRequest,
        sw: Arc<dyn SseWriter>,
    ) -> Result<Option<ProxyResponse>> {
        let provider = self.registry.lookup(&req.chat.model)?;
        // Headers are still open until the provider's first event.
        sw.set_header("X-Provider", provider.name());

        let usage = provider.chat_stream(&req.chat, sw.as_ref()).await?;

        let (input_tokens, output_tokens) = usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((0, 0));
        let cost = pricing::calculate(&req.chat.model, input_tokens, output_tokens);

        // Nothing to serialize; the client already got the stream.
        Ok(Some(ProxyResponse {
            chat_response: None,
            output_tokens,
            cost,
            cache_status: CacheStatus::Miss,
            provider_name: provider.name().to_string(),
        }))
    }
}
