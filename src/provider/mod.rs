mod anthropic;
mod google;
mod openai;

pub use anthropic::Anthropic;
pub use google::Google;
pub use openai::OpenAiCompat;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use async_trait::async_trait;

use crate::error::{ProxyError, Result};
use crate::sse::SseWriter;
use crate::types::{ChatRequest, ChatResponse, Usage};

/// An upstream chat-completion API.
///
/// `chat` returns the full buffered response. `chat_stream` writes
/// canonical SSE chunks (and the terminal `[DONE]`) to the given writer as
/// they arrive from the upstream, returning the usage when the upstream
/// reported one.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;
    fn models(&self) -> &[String];
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse>;
    async fn chat_stream(&self, req: &ChatRequest, sw: &dyn SseWriter) -> Result<Option<Usage>>;
}

/// Maps model names to providers. Mutated during startup, then frozen into
/// an immutable snapshot so lookups are lock-free for the life of the
/// process. Registrations happen strictly before any request.
#[derive(Default)]
pub struct Registry {
    providers: RwLock<HashMap<String, Arc<dyn Provider>>>,
    frozen: OnceLock<HashMap<String, Arc<dyn Provider>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a provider for every model it supports.
    pub fn register(&self, provider: Arc<dyn Provider>) {
        let mut providers = self.providers.write().expect("registry lock");
        for model in provider.models() {
            providers.insert(model.clone(), provider.clone());
        }
    }

    /// Snapshots the registrations. Call once after startup wiring;
    /// subsequent `register` calls are invisible to `lookup`.
    pub fn freeze(&self) {
        let snapshot = self.providers.read().expect("registry lock").clone();
        let _ = self.frozen.set(snapshot);
    }

    pub fn lookup(&self, model: &str) -> Result<Arc<dyn Provider>> {
        if let Some(snapshot) = self.frozen.get() {
            return snapshot
                .get(model)
                .cloned()
                .ok_or_else(|| ProxyError::NoProvider(model.to_string()));
        }
        self.providers
            .read()
            .expect("registry lock")
            .get(model)
            .cloned()
            .ok_or_else(|| ProxyError::NoProvider(model.to_string()))
    }
}
