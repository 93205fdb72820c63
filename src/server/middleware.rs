use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(0);

/// Per-request id, available to handlers via request extensions.
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

/// Tags each request with a process-unique id, reflects it as the
/// `X-Request-ID` response header, and logs the request once the handler
/// returns. Response headers are still mutable here even for streaming
/// bodies; nothing is on the wire until this layer returns.
pub async fn request_context(mut req: Request, next: Next) -> Response {
    let id = format!("{:x}", REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed) + 1);
    req.extensions_mut().insert(RequestId(id.clone()));

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();

    let mut response = next.run(req).await;

    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("x-request-id", value);
    }

    tracing::info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        request_id = %id,
        "request"
    );

    response
}
