use sha2::{Digest, Sha256};

use crate::embedding::{EmbeddingClient, text_from_messages};
use crate::error::Result;
use crate::qdrant::{CachedPayload, QdrantClient};
use crate::types::{ChatRequest, ChatResponse, unix_now};
use crate::utils::hex_encode;

/// Embedding-similarity cache over an external vector store.
///
/// Every failure inside `lookup` degrades to a miss so the dispatch path
/// can proceed; the request is never failed because of a cache problem.
pub struct SemanticCache {
    embedder: EmbeddingClient,
    qdrant: QdrantClient,
    threshold: f32,
}

impl SemanticCache {
    pub fn new(embedder: EmbeddingClient, qdrant: QdrantClient, threshold: f32) -> Self {
        Self {
            embedder,
            qdrant,
            threshold,
        }
    }

    /// Embeds the request and searches for the single best match under the
    /// same model at or above the threshold.
    ///
    /// Returns the cached response (if any) and the computed embedding.
    /// The embedding comes back even on a miss or a failed search so
    /// [`SemanticCache::store`] can reuse it without recomputing.
    pub async fn lookup(&self, req: &ChatRequest) -> (Option<ChatResponse>, Option<Vec<f32>>) {
        let text = text_from_messages(&req.messages);

        let embedding = match self.embedder.embed(&text).await {
            Ok(embedding) => embedding,
            Err(err) => {
                tracing::debug!(error = %err, "semantic lookup: embedding failed");
                return (None, None);
            }
        };

        let results = match self.qdrant.search(&embedding, 1, self.threshold, &req.model).await {
            Ok(results) => results,
            Err(err) => {
                tracing::debug!(error = %err, "semantic lookup: vector search failed");
                return (None, Some(embedding));
            }
        };

        let response = results
            .into_iter()
            .next()
            .and_then(|result| result.payload)
            .and_then(|payload| payload.response);
        (response, Some(embedding))
    }

    /// Saves a response for future semantic lookups. Reuses the embedding
    /// produced during lookup when one is available; otherwise computes a
    /// fresh one.
    pub async fn store(
        &self,
        req: &ChatRequest,
        resp: &ChatResponse,
        embedding: Option<Vec<f32>>,
    ) -> Result<()> {
        let embedding = match embedding {
            Some(embedding) => embedding,
            None => {
                let text = text_from_messages(&req.messages);
                self.embedder.embed(&text).await?
            }
        };

        let payload = CachedPayload {
            response: Some(resp.clone()),
            model: req.model.clone(),
            created_at: unix_now(),
        };
        self.qdrant.upsert(&point_id(req), &embedding, &payload).await
    }
}

/// Deterministic point id: the first 128 bits of
/// SHA-256(model ":" canonical-text), rendered as a UUID (the only string
/// id form Qdrant accepts).
pub fn point_id(req: &ChatRequest) -> String {
    let text = text_from_messages(&req.messages);
    let mut hasher = Sha256::new();
    hasher.update(req.model.as_bytes());
    hasher.update(b":");
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    let hex = hex_encode(&digest[..16]);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}
