mod handler;
mod middleware;

pub use middleware::RequestId;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use crate::cache::ExactCache;
use crate::pipeline::Pipeline;
use crate::qdrant::QdrantClient;

/// Vector size of the semantic-cache collection; matches the default
/// embedding dimension.
pub const VECTOR_SIZE: usize = 1536;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub exact_cache: Option<Arc<ExactCache>>,
    pub qdrant: Option<Arc<QdrantClient>>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            pipeline,
            exact_cache: None,
            qdrant: None,
        }
    }

    pub fn with_exact_cache(mut self, cache: Arc<ExactCache>) -> Self {
        self.exact_cache = Some(cache);
        self
    }

    pub fn with_qdrant(mut self, qdrant: Arc<QdrantClient>) -> Self {
        self.qdrant = Some(qdrant);
        self
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(handler::chat_completions))
        .route("/health", get(handler::health))
        .route("/admin/cache/clear", post(handler::clear_cache))
        .layer(axum::middleware::from_fn(middleware::request_context))
        .with_state(state)
}
