use std::sync::Arc;

use async_trait::async_trait;

use super::{Stage, StreamStage};
use crate::cache::ExactCache;
use crate::error::Result;
use crate::sse::{SseWriter, write_response_as_sse};
use crate::types::{CacheStatus, ChatResponse, ProxyRequest, ProxyResponse};

/// Checks the exact-match cache ahead of provider dispatch. Lookup only;
/// storing is the handler's job, since only the downstream result shows
/// whether there is anything to store.
pub struct ExactCacheStage {
    cache: Arc<ExactCache>,
    skip_temp_above_zero: bool,
}

impl ExactCacheStage {
    pub fn new(cache: Arc<ExactCache>, skip_temp_above_zero: bool) -> Self {
        Self {
            cache,
            skip_temp_above_zero,
        }
    }

    fn should_skip(&self, req: &ProxyRequest) -> bool {
        // Only a temperature explicitly set above zero bypasses the cache.
        self.skip_temp_above_zero && req.chat.temperature.is_some_and(|t| t > 0.0)
    }

    fn hit_response(response: ChatResponse) -> ProxyResponse {
        let output_tokens = response.usage.completion_tokens;
        ProxyResponse {
            chat_response: Some(response),
            output_tokens,
            cost: 0.0,
            cache_status: CacheStatus::Hit,
            provider_name: "cache".to_string(),
        }
    }
}

#[async_trait]
impl Stage for ExactCacheStage {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn process(&self, req: &ProxyRequest) -> Result<Option<ProxyResponse>> {
        if self.should_skip(req) {
            return Ok(None);
        }
        Ok(self.cache.get(&req.chat).map(Self::hit_response))
    }
}

#[async_trait]
impl StreamStage for ExactCacheStage {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn process_stream(
        &self,
        req: &ProxyRequest,
        sw: Arc<dyn SseWriter>,
    ) -> Result<Option<ProxyResponse>> {
        if self.should_skip(req) {
            return Ok(None);
        }
        let Some(response) = self.cache.get(&req.chat) else {
            return Ok(None);
        };

        sw.set_header("X-Cache", "HIT");
        sw.set_header("X-Provider", "cache");
        write_response_as_sse(sw.as_ref(), &response).await?;

        Ok(Some(Self::hit_response(response)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse::MemoryWriter;
    use crate::types::{ChatRequest, Choice, Message, Usage};
    use std::time::{Duration, Instant};

    fn proxy_request(temperature: Option<f64>) -> ProxyRequest {
        ProxyRequest {
            chat: ChatRequest {
                model: "gpt-4o".to_string(),
                messages: vec![Message::new("user", "hello")],
                temperature,
                ..Default::default()
            },
            request_id: "req-1".to_string(),
            received_at: Instant::now(),
            input_tokens: 2,
            api_key: String::new(),
        }
    }

    fn cached_response() -> ChatResponse {
        ChatResponse {
            id: "cached-1".to_string(),
            object: "chat.completion".to_string(),
            created: 0,
            model: "gpt-4o".to_string(),
            choices: vec![Choice {
                index: 0,
                message: Message::new("assistant", "hi there"),
                finish_reason: "stop".to_string(),
            }],
            usage: Usage {
                prompt_tokens: 4,
                completion_tokens: 9,
                total_tokens: 13,
            },
        }
    }

    fn stage_with_entry() -> ExactCacheStage {
        let cache = Arc::new(ExactCache::new(Duration::from_secs(60), 16));
        cache.put(&proxy_request(None).chat, cached_response());
        ExactCacheStage::new(cache, true)
    }

    #[tokio::test]
    async fn buffered_hit_builds_cache_proxy_response() {
        let stage = stage_with_entry();
        let response = Stage::process(&stage, &proxy_request(None))
            .await
            .expect("ok")
            .expect("hit");

        assert_eq!(response.cache_status, CacheStatus::Hit);
        assert_eq!(response.provider_name, "cache");
        assert_eq!(response.cost, 0.0);
        assert_eq!(response.output_tokens, 9);
        assert_eq!(response.chat_response.expect("body").id, "cached-1");
    }

    #[tokio::test]
    async fn buffered_miss_passes_through() {
        let cache = Arc::new(ExactCache::new(Duration::from_secs(60), 16));
        let stage = ExactCacheStage::new(cache, true);
        let result = Stage::process(&stage, &proxy_request(None)).await.expect("ok");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn positive_temperature_bypasses_even_on_would_be_hit() {
        let stage = stage_with_entry();
        let result = Stage::process(&stage, &proxy_request(Some(0.7)))
            .await
            .expect("ok");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn zero_temperature_still_consults_the_cache() {
        let stage = stage_with_entry();
        // Key includes temperature, so seed an entry for the zero variant.
        let req = proxy_request(Some(0.0));
        stage.cache.put(&req.chat, cached_response());
        let result = Stage::process(&stage, &req).await.expect("ok");
        assert!(result.is_some());
    }

    #[tokio::test]
    async fn streaming_hit_sets_headers_and_replays() {
        let stage = stage_with_entry();
        let writer = MemoryWriter::new();
        let response = StreamStage::process_stream(&stage, &proxy_request(None), writer.clone())
            .await
            .expect("ok")
            .expect("hit");

        assert_eq!(response.cache_status, CacheStatus::Hit);
        assert_eq!(writer.header("X-Cache").as_deref(), Some("HIT"));
        assert_eq!(writer.header("X-Provider").as_deref(), Some("cache"));

        let events = writer.events();
        // Role, one content, finish, [DONE].
        assert_eq!(events.len(), 4);
        assert!(events[1].contains("hi there"));
        assert_eq!(events[3], "[DONE]");
    }

    #[tokio::test]
    async fn streaming_miss_writes_nothing() {
        let cache = Arc::new(ExactCache::new(Duration::from_secs(60), 16));
        let stage = ExactCacheStage::new(cache, true);
        let writer = MemoryWriter::new();
        let result = StreamStage::process_stream(&stage, &proxy_request(None), writer.clone())
            .await
            .expect("ok");
        assert!(result.is_none());
        assert!(writer.events().is_empty());
    }
}
