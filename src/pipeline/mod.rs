mod dispatch;
mod exact_cache;
mod semantic_dispatch;

pub use dispatch::DispatchStage;
pub use exact_cache::ExactCacheStage;
pub use semantic_dispatch::SemanticDispatchStage;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{ProxyError, Result};
use crate::sse::SseWriter;
use crate::types::{ProxyRequest, ProxyResponse};

/// A buffered pipeline stage. Returning `Some` short-circuits the
/// remainder of the pipeline; `None` passes the request along.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;
    async fn process(&self, req: &ProxyRequest) -> Result<Option<ProxyResponse>>;
}

/// A streaming pipeline stage. A stage that returns `Some` has already
/// written every SSE event (including the terminal `[DONE]`).
#[async_trait]
pub trait StreamStage: Send + Sync {
    fn name(&self) -> &'static str;
    async fn process_stream(
        &self,
        req: &ProxyRequest,
        sw: Arc<dyn SseWriter>,
    ) -> Result<Option<ProxyResponse>>;
}

/// A pipeline slot holding whichever of the two capabilities its stage
/// implements. A stage lacking a capability is silently skipped by the
/// corresponding execute method.
pub struct StageEntry {
    buffered: Option<Arc<dyn Stage>>,
    streaming: Option<Arc<dyn StreamStage>>,
}

impl StageEntry {
    pub fn both<S>(stage: Arc<S>) -> Self
    where
        S: Stage + StreamStage + 'static,
    {
        Self {
            buffered: Some(stage.clone()),
            streaming: Some(stage),
        }
    }

    pub fn buffered(stage: Arc<dyn Stage>) -> Self {
        Self {
            buffered: Some(stage),
            streaming: None,
        }
    }

    pub fn streaming(stage: Arc<dyn StreamStage>) -> Self {
        Self {
            buffered: None,
            streaming: Some(stage),
        }
    }
}

/// An ordered list of stages; the first stage to produce a response wins.
pub struct Pipeline {
    stages: Vec<StageEntry>,
}

impl Pipeline {
    pub fn new(stages: Vec<StageEntry>) -> Self {
        Self { stages }
    }

    /// Runs the buffered pipeline. Fails with [`ProxyError::NoProducer`]
    /// when every stage passes.
    pub async fn execute(&self, req: &ProxyRequest) -> Result<ProxyResponse> {
        for entry in &self.stages {
            let Some(stage) = entry.buffered.as_ref() else {
                continue;
            };
            let response = stage
                .process(req)
                .await
                .map_err(|err| err.in_stage(stage.name()))?;
            if let Some(response) = response {
                return Ok(response);
            }
        }
        Err(ProxyError::NoProducer)
    }

    /// Runs the streaming pipeline against the given writer.
    pub async fn execute_stream(
        &self,
        req: &ProxyRequest,
        sw: Arc<dyn SseWriter>,
    ) -> Result<ProxyResponse> {
        for entry in &self.stages {
            let Some(stage) = entry.streaming.as_ref() else {
                continue;
            };
            let response = stage
                .process_stream(req, sw.clone())
                .await
                .map_err(|err| err.in_stage(stage.name()))?;
            if let Some(response) = response {
                return Ok(response);
            }
        }
        Err(ProxyError::NoProducer)
    }
}
