use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{DispatchStage, Stage, StreamStage};
use crate::cache::SemanticCache;
use crate::error::{ProxyError, Result};
use crate::sse::{SseWriter, write_response_as_sse};
use crate::types::{CacheStatus, ChatRequest, ChatResponse, ProxyRequest, ProxyResponse};

const STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Races a semantic cache lookup against provider dispatch.
///
/// Dispatch begins its upstream call in parallel with the embedding and
/// vector-search round-trips; if the semantic side produces a hit first,
/// the dispatch task is aborted and its result discarded. After a dispatch
/// win the observed response is stored into the vector store from a
/// detached task.
pub struct SemanticDispatchStage {
    semantic: Arc<SemanticCache>,
    dispatch: Arc<DispatchStage>,
}

type LookupResult = (Option<ChatResponse>, Option<Vec<f32>>);

impl SemanticDispatchStage {
    pub fn new(semantic: Arc<SemanticCache>, dispatch: Arc<DispatchStage>) -> Self {
        Self { semantic, dispatch }
    }

    fn should_skip(req: &ProxyRequest) -> bool {
        req.chat.temperature.is_some_and(|t| t > 0.0)
    }

    fn hit_response(response: ChatResponse) -> ProxyResponse {
        let output_tokens = response.usage.completion_tokens;
        ProxyResponse {
            chat_response: Some(response),
            output_tokens,
            cost: 0.0,
            cache_status: CacheStatus::Hit,
            provider_name: "semantic_cache".to_string(),
        }
    }

    fn spawn_lookup(&self, chat: ChatRequest) -> JoinHandle<LookupResult> {
        let semantic = self.semantic.clone();
        tokio::spawn(async move { semantic.lookup(&chat).await })
    }

    /// Fire-and-forget upsert on its own task, detached from the request
    /// scope so a client disconnect cannot abort it. Failures never
    /// propagate.
    fn spawn_store(&self, chat: ChatRequest, response: ChatResponse, embedding: Option<Vec<f32>>) {
        let semantic = self.semantic.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(
                STORE_TIMEOUT,
                semantic.store(&chat, &response, embedding),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::debug!(error = %err, "async semantic store failed"),
                Err(_) => tracing::debug!("async semantic store timed out"),
            }
        });
    }
}

#[async_trait]
impl Stage for SemanticDispatchStage {
    fn name(&self) -> &'static str {
        "semantic_dispatch"
    }

    async fn process(&self, req: &ProxyRequest) -> Result<Option<ProxyResponse>> {
        if Self::should_skip(req) {
            return self.dispatch.process(req).await;
        }

        let mut lookup_task = self.spawn_lookup(req.chat.clone());
        let mut dispatch_task = {
            let dispatch = self.dispatch.clone();
            let req = req.clone();
            tokio::spawn(async move { dispatch.process(&req).await })
        };

        let mut lookup_done = false;
        let mut lookup_embedding: Option<Vec<f32>> = None;
        let mut dispatch_result: Option<Result<Option<ProxyResponse>>> = None;

        while !(lookup_done && dispatch_result.is_some()) {
            tokio::select! {
                joined = &mut lookup_task, if !lookup_done => {
                    lookup_done = true;
                    match joined {
                        Ok((Some(response), _)) => {
                            // Semantic hit wins the race; the in-flight
                            // upstream call is abandoned best-effort.
                            dispatch_task.abort();
                            return Ok(Some(Self::hit_response(response)));
                        }
                        Ok((None, embedding)) => lookup_embedding = embedding,
                        Err(err) => tracing::debug!(error = %err, "semantic lookup task failed"),
                    }
                }
                joined = &mut dispatch_task, if dispatch_result.is_none() => {
                    dispatch_result = Some(joined.unwrap_or_else(|err| {
                        Err(ProxyError::InvalidResponse(format!("dispatch task failed: {err}")))
                    }));
                }
            }
        }

        let response = dispatch_result.expect("dispatch completed")?;
        if let Some(chat_response) = response.as_ref().and_then(|r| r.chat_response.clone()) {
            self.spawn_store(req.chat.clone(), chat_response, lookup_embedding);
        }
        Ok(response)
    }
}

#[async_trait]
impl StreamStage for SemanticDispatchStage {
    fn name(&self) -> &'static str {
        "semantic_dispatch"
    }

    async fn process_stream(
        &self,
        req: &ProxyRequest,
        sw: Arc<dyn SseWriter>,
    ) -> Result<Option<ProxyResponse>> {
        if Self::should_skip(req) {
            return self.dispatch.process_stream(req, sw).await;
        }

        let mut lookup_task = self.spawn_lookup(req.chat.clone());

        // Dispatch starts its upstream request immediately but may not
        // emit bytes to the client until the semantic outcome is known.
        let gated = GatedWriter::new(sw.clone());
        let mut dispatch_task = {
            let dispatch = self.dispatch.clone();
            let req = req.clone();
            let writer: Arc<dyn SseWriter> = gated.clone();
            tokio::spawn(async move { dispatch.process_stream(&req, writer).await })
        };

        let mut lookup_done = false;
        let mut lookup_embedding: Option<Vec<f32>> = None;
        let mut dispatch_result: Option<Result<Option<ProxyResponse>>> = None;

        while !(lookup_done && dispatch_result.is_some()) {
            tokio::select! {
                joined = &mut lookup_task, if !lookup_done => {
                    lookup_done = true;
                    if let Ok((Some(response), _)) = &joined {
                        if gated.claim() {
                            dispatch_task.abort();
                            sw.set_header("X-Cache", "HIT");
                            sw.set_header("X-Provider", "semantic_cache");
                            write_response_as_sse(sw.as_ref(), response).await?;
                            return Ok(Some(Self::hit_response(response.clone())));
                        }
                        // Dispatch already owns the stream; fall through as
                        // a miss.
                    }
                    if let Ok((_, embedding)) = joined {
                        lookup_embedding = embedding;
                    }
                    gated.release();
                }
                joined = &mut dispatch_task, if dispatch_result.is_none() => {
                    dispatch_result = Some(joined.unwrap_or_else(|err| {
                        Err(ProxyError::InvalidResponse(format!("dispatch task failed: {err}")))
                    }));
                }
            }
        }

        let response = dispatch_result.expect("dispatch completed")?;
        if let Some(chat_response) = response.as_ref().and_then(|r| r.chat_response.clone()) {
            self.spawn_store(req.chat.clone(), chat_response, lookup_embedding);
        }
        Ok(response)
    }
}

#[derive(Default)]
struct GateState {
    claimed: bool,
    writing: bool,
}

/// Wraps the client writer with a one-shot latch that decides, under
/// concurrency, which of the two racing producers may emit bytes.
///
/// Writers block on the latch. `release` opens it without claiming;
/// blocked writers then proceed and mark `writing`. `claim` fails once a
/// write has passed the gate; on success every subsequent gated write is
/// discarded as cancelled so the upstream read loop unwinds cleanly.
struct GatedWriter {
    inner: Arc<dyn SseWriter>,
    state: Mutex<GateState>,
    gate: watch::Sender<bool>,
}

impl GatedWriter {
    fn new(inner: Arc<dyn SseWriter>) -> Arc<Self> {
        let (gate, _) = watch::channel(false);
        Arc::new(Self {
            inner,
            state: Mutex::new(GateState::default()),
            gate,
        })
    }

    /// Blocks until the gate opens. Returns false when the write must be
    /// discarded because the semantic side claimed the stream.
    async fn wait_for_gate(&self) -> bool {
        let mut rx = self.gate.subscribe();
        loop {
            if *rx.borrow_and_update() {
                break;
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }

        let mut state = self.state.lock().expect("gate lock");
        if state.claimed {
            return false;
        }
        state.writing = true;
        true
    }

    /// Claims the stream for the semantic winner. Fails if dispatch has
    /// already started writing.
    fn claim(&self) -> bool {
        let mut state = self.state.lock().expect("gate lock");
        if state.writing {
            return false;
        }
        state.claimed = true;
        self.gate.send_replace(true);
        true
    }

    /// Opens the gate toward dispatch; no semantic claim is possible once
    /// a blocked write proceeds.
    fn release(&self) {
        self.gate.send_replace(true);
    }
}

#[async_trait]
impl SseWriter for GatedWriter {
    fn set_header(&self, key: &str, value: &str) {
        self.inner.set_header(key, value);
    }

    async fn write_event(&self, data: &[u8]) -> Result<()> {
        if !self.wait_for_gate().await {
            return Err(ProxyError::Cancelled);
        }
        self.inner.write_event(data).await
    }

    async fn done(&self) -> Result<()> {
        if !self.wait_for_gate().await {
            return Err(ProxyError::Cancelled);
        }
        self.inner.done().await
    }
}
