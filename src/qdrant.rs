use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::embedding::truncated_body;
use crate::error::{ProxyError, Result};
use crate::types::ChatResponse;
use crate::utils::http_client;

/// Data stored alongside each vector in Qdrant.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CachedPayload {
    pub response: Option<ChatResponse>,
    pub model: String,
    pub created_at: i64,
}

/// A single match from a similarity search.
#[derive(Clone, Debug)]
pub struct SearchResult {
    pub id: String,
    pub score: f32,
    pub payload: Option<CachedPayload>,
}

/// REST client for Qdrant collections, search, and upsert.
#[derive(Clone)]
pub struct QdrantClient {
    base_url: String,
    api_key: String,
    collection: String,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    vector: &'a [f32],
    limit: usize,
    score_threshold: f32,
    with_payload: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<QueryFilter<'a>>,
}

#[derive(Serialize)]
struct QueryFilter<'a> {
    must: Vec<FilterCondition<'a>>,
}

#[derive(Serialize)]
struct FilterCondition<'a> {
    key: &'a str,
    r#match: MatchValue<'a>,
}

#[derive(Serialize)]
struct MatchValue<'a> {
    value: &'a str,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    result: Vec<RawSearchResult>,
}

#[derive(Deserialize)]
struct RawSearchResult {
    id: serde_json::Value,
    #[serde(default)]
    score: f32,
    #[serde(default)]
    payload: Option<Box<RawValue>>,
}

#[derive(Serialize)]
struct UpsertRequest<'a> {
    points: Vec<Point<'a>>,
}

#[derive(Serialize)]
struct Point<'a> {
    id: &'a str,
    vector: &'a [f32],
    payload: &'a CachedPayload,
}

impl QdrantClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            collection: collection.into(),
            http: http_client(100),
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.is_empty() {
            builder
        } else {
            builder.header("api-key", &self.api_key)
        }
    }

    fn collection_url(&self) -> String {
        format!("{}/collections/{}", self.base_url, self.collection)
    }

    /// Creates the collection if missing. 200 (created) and 409 (already
    /// exists) are both success.
    pub async fn ensure_collection(&self, vector_size: usize) -> Result<()> {
        let body = serde_json::json!({
            "vectors": { "size": vector_size, "distance": "Cosine" }
        });

        let response = self
            .request(self.http.put(self.collection_url()))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status != reqwest::StatusCode::OK && status != reqwest::StatusCode::CONFLICT {
            let body = truncated_body(response).await;
            return Err(ProxyError::Upstream { status, body });
        }
        Ok(())
    }

    /// Finds the closest points above `score_threshold`, filtered by model.
    pub async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        score_threshold: f32,
        model_filter: &str,
    ) -> Result<Vec<SearchResult>> {
        let filter = (!model_filter.is_empty()).then(|| QueryFilter {
            must: vec![FilterCondition {
                key: "model",
                r#match: MatchValue {
                    value: model_filter,
                },
            }],
        });
        let body = SearchRequest {
            vector,
            limit,
            score_threshold,
            with_payload: true,
            filter,
        };

        let response = self
            .request(
                self.http
                    .post(format!("{}/points/search", self.collection_url())),
            )
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = truncated_body(response).await;
            return Err(ProxyError::Upstream { status, body });
        }

        let parsed = response.json::<SearchResponse>().await?;
        let mut results = Vec::with_capacity(parsed.result.len());
        for raw in parsed.result {
            // Qdrant ids may be integers or UUID strings; normalize.
            let id = match raw.id {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            let payload = raw
                .payload
                .and_then(|p| serde_json::from_str::<CachedPayload>(p.get()).ok());
            results.push(SearchResult {
                id,
                score: raw.score,
                payload,
            });
        }
        Ok(results)
    }

    /// Inserts or replaces a point.
    pub async fn upsert(&self, id: &str, vector: &[f32], payload: &CachedPayload) -> Result<()> {
        let body = UpsertRequest {
            points: vec![Point {
                id,
                vector,
                payload,
            }],
        };

        let response = self
            .request(self.http.put(format!("{}/points", self.collection_url())))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = truncated_body(response).await;
            return Err(ProxyError::Upstream { status, body });
        }
        Ok(())
    }

    /// Drops the collection.
    pub async fn delete_collection(&self) -> Result<()> {
        let response = self
            .request(self.http.delete(self.collection_url()))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = truncated_body(response).await;
            return Err(ProxyError::Upstream { status, body });
        }
        Ok(())
    }
}
