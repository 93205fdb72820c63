use std::convert::Infallible;
use std::time::Instant;

use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::{Extension, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures_util::stream;
use serde_json::json;

use super::{AppState, RequestId, VECTOR_SIZE};
use crate::sse::ChannelWriter;
use crate::token_count;
use crate::types::{CacheStatus, ChatRequest, ErrorResponse, ProxyRequest, ProxyResponse};

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let chat: ChatRequest = match serde_json::from_slice(&body) {
        Ok(chat) => chat,
        Err(err) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                format!("Failed to parse request body: {err}"),
            );
        }
    };

    if chat.model.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            "model is required",
        );
    }

    // Buffered requests get accurate usage from upstream; streaming needs
    // a coarse estimate up front for the X-Tokens-Input header.
    let input_tokens = if chat.stream {
        token_count::quick_estimate(&chat.messages)
    } else {
        0
    };

    let proxy_req = ProxyRequest {
        chat,
        request_id,
        received_at: Instant::now(),
        input_tokens,
        api_key: extract_bearer(&headers).unwrap_or_default(),
    };

    if proxy_req.chat.stream {
        handle_streaming(state, proxy_req).await
    } else {
        handle_buffered(state, proxy_req).await
    }
}

async fn handle_buffered(state: AppState, proxy_req: ProxyRequest) -> Response {
    let response = match state.pipeline.execute(&proxy_req).await {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(request_id = %proxy_req.request_id, error = %err, "pipeline error");
            return error_response(StatusCode::BAD_GATEWAY, "upstream_error", err.to_string());
        }
    };

    store_on_miss(&state, &proxy_req, &response);

    let Some(chat_response) = response.chat_response else {
        tracing::error!(request_id = %proxy_req.request_id, "buffered pipeline produced no body");
        return error_response(
            StatusCode::BAD_GATEWAY,
            "upstream_error",
            "upstream produced no response body",
        );
    };

    let mut headers = HeaderMap::new();
    insert_header(&mut headers, "x-request-cost", &format!("{:.8}", response.cost));
    insert_header(
        &mut headers,
        "x-tokens-input",
        &chat_response.usage.prompt_tokens.to_string(),
    );
    insert_header(
        &mut headers,
        "x-tokens-output",
        &response.output_tokens.to_string(),
    );
    insert_header(&mut headers, "x-cache", response.cache_status.as_str());
    insert_header(&mut headers, "x-provider", &response.provider_name);

    (StatusCode::OK, headers, Json(chat_response)).into_response()
}

/// The exact cache is populated by the handler once a buffered MISS
/// succeeds, under the same temperature gate as lookup.
fn store_on_miss(state: &AppState, proxy_req: &ProxyRequest, response: &ProxyResponse) {
    if response.cache_status != CacheStatus::Miss {
        return;
    }
    if proxy_req.chat.temperature.is_some_and(|t| t > 0.0) {
        return;
    }
    let (Some(cache), Some(chat_response)) =
        (state.exact_cache.as_ref(), response.chat_response.as_ref())
    else {
        return;
    };
    cache.put(&proxy_req.chat, chat_response.clone());
}

async fn handle_streaming(state: AppState, proxy_req: ProxyRequest) -> Response {
    let mut initial_headers = ChannelWriter::sse_headers();
    insert_header(
        &mut initial_headers,
        "x-tokens-input",
        &proxy_req.input_tokens.to_string(),
    );
    insert_header(&mut initial_headers, "x-cache", "MISS");

    let (writer, commit_rx, body_rx) = ChannelWriter::new(initial_headers);

    let pipeline = state.pipeline.clone();
    let task_req = proxy_req.clone();
    let task = tokio::spawn(async move { pipeline.execute_stream(&task_req, writer).await });

    // The first SSE event commits the headers; the commit receiver fails
    // instead when the pipeline finishes without writing anything, and a
    // regular JSON error is still possible.
    match commit_rx.await {
        Ok(headers) => {
            spawn_stream_logger(proxy_req.request_id, task);
            streaming_response(headers, body_rx)
        }
        Err(_) => finish_unstarted_stream(&proxy_req.request_id, task).await,
    }
}

fn streaming_response(headers: HeaderMap, body_rx: tokio::sync::mpsc::Receiver<Bytes>) -> Response {
    let body = Body::from_stream(stream::unfold(body_rx, |mut rx| async move {
        rx.recv().await.map(|frame| (Ok::<_, Infallible>(frame), rx))
    }));
    let mut response = Response::new(body);
    *response.headers_mut() = headers;
    response
}

fn spawn_stream_logger(
    request_id: String,
    task: tokio::task::JoinHandle<crate::error::Result<ProxyResponse>>,
) {
    tokio::spawn(async move {
        match task.await {
            Ok(Ok(response)) => tracing::info!(
                request_id = %request_id,
                output_tokens = response.output_tokens,
                cost = response.cost,
                provider = %response.provider_name,
                "stream completed"
            ),
            // Headers are committed; the truncation can only be logged.
            Ok(Err(err)) => tracing::error!(
                request_id = %request_id,
                error = %err,
                "streaming pipeline error"
            ),
            Err(err) => tracing::error!(
                request_id = %request_id,
                error = %err,
                "streaming task failed"
            ),
        }
    });
}

/// The pipeline finished without writing a single event, so the error
/// path is still open.
async fn finish_unstarted_stream(
    request_id: &str,
    task: tokio::task::JoinHandle<crate::error::Result<ProxyResponse>>,
) -> Response {
    match task.await {
        Ok(Ok(_)) => {
            tracing::error!(request_id = %request_id, "stream produced no events");
            error_response(
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                "stream produced no events",
            )
        }
        Ok(Err(err)) => {
            tracing::error!(request_id = %request_id, error = %err, "streaming pipeline error");
            error_response(StatusCode::BAD_GATEWAY, "upstream_error", err.to_string())
        }
        Err(err) => {
            tracing::error!(request_id = %request_id, error = %err, "streaming task failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "server_error",
                "internal server error",
            )
        }
    }
}

pub async fn clear_cache(State(state): State<AppState>) -> Response {
    if let Some(cache) = state.exact_cache.as_ref() {
        cache.clear();
    }

    if let Some(qdrant) = state.qdrant.as_ref() {
        if let Err(err) = qdrant.delete_collection().await {
            tracing::error!(error = %err, "failed to delete vector collection");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "server_error",
                "failed to delete vector collection",
            );
        }
        if let Err(err) = qdrant.ensure_collection(VECTOR_SIZE).await {
            tracing::error!(error = %err, "failed to recreate vector collection");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "server_error",
                "failed to recreate vector collection",
            );
        }
    }

    tracing::info!("cache cleared via admin endpoint");
    Json(json!({"status": "ok"})).into_response()
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn insert_header(headers: &mut HeaderMap, key: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(key, value);
    }
}

fn error_response(
    status: StatusCode,
    kind: &'static str,
    message: impl Into<String>,
) -> Response {
    (status, Json(ErrorResponse::new(kind, message))).into_response()
}
