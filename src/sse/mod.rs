mod replay;

pub use replay::write_response_as_sse;

use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::error::{ProxyError, Result};

/// A sink for Server-Sent Events.
///
/// `set_header` is only honored before the first event is written; by then
/// the transport has committed the response headers. `write_event` frames
/// its payload as `data: <payload>\n\n`; `done` emits the terminal
/// `data: [DONE]\n\n`.
#[async_trait]
pub trait SseWriter: Send + Sync {
    fn set_header(&self, key: &str, value: &str);
    async fn write_event(&self, data: &[u8]) -> Result<()>;
    async fn done(&self) -> Result<()>;
}

/// Serializes `value` and sends it as a single SSE event.
pub async fn write_json<T: Serialize + ?Sized>(sw: &dyn SseWriter, value: &T) -> Result<()> {
    let data = serde_json::to_vec(value)?;
    sw.write_event(&data).await
}

fn frame_event(data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(6 + data.len() + 2);
    buf.put_slice(b"data: ");
    buf.put_slice(data);
    buf.put_slice(b"\n\n");
    buf.freeze()
}

struct HeaderState {
    headers: HeaderMap,
    // Present until the first event commits the headers to the transport.
    commit: Option<oneshot::Sender<HeaderMap>>,
}

/// An [`SseWriter`] whose framed events flow through an mpsc channel into
/// an HTTP response body. Response headers accumulate until the first
/// event, at which point they are handed to the response task through a
/// oneshot channel.
pub struct ChannelWriter {
    tx: mpsc::Sender<Bytes>,
    state: Mutex<HeaderState>,
}

impl ChannelWriter {
    const CHANNEL_CAPACITY: usize = 32;

    /// Creates a writer along with the header-commit receiver and the
    /// framed-event receiver. The commit receiver resolves when the first
    /// event is written; it errors if the writer is dropped without ever
    /// writing (the caller then still holds the error path).
    pub fn new(
        initial_headers: HeaderMap,
    ) -> (Arc<Self>, oneshot::Receiver<HeaderMap>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(Self::CHANNEL_CAPACITY);
        let (commit_tx, commit_rx) = oneshot::channel();
        let writer = Arc::new(Self {
            tx,
            state: Mutex::new(HeaderState {
                headers: initial_headers,
                commit: Some(commit_tx),
            }),
        });
        (writer, commit_rx, rx)
    }

    /// The standard SSE response headers plus any extras the caller wants
    /// pre-set; stages may override them until the first event.
    pub fn sse_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/event-stream"));
        headers.insert("cache-control", HeaderValue::from_static("no-cache"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers
    }

    fn commit_headers(&self) {
        let mut state = self.state.lock().expect("sse header lock");
        if let Some(commit) = state.commit.take() {
            let _ = commit.send(state.headers.clone());
        }
    }

    async fn send(&self, frame: Bytes) -> Result<()> {
        self.commit_headers();
        self.tx
            .send(frame)
            .await
            .map_err(|_| ProxyError::StreamClosed)
    }
}

#[async_trait]
impl SseWriter for ChannelWriter {
    fn set_header(&self, key: &str, value: &str) {
        let mut state = self.state.lock().expect("sse header lock");
        if state.commit.is_none() {
            // Headers already on the wire.
            return;
        }
        let (Ok(name), Ok(value)) = (
            HeaderName::try_from(key),
            HeaderValue::try_from(value),
        ) else {
            tracing::debug!(key, "dropping invalid sse header");
            return;
        };
        state.headers.insert(name, value);
    }

    async fn write_event(&self, data: &[u8]) -> Result<()> {
        self.send(frame_event(data)).await
    }

    async fn done(&self) -> Result<()> {
        self.send(Bytes::from_static(b"data: [DONE]\n\n")).await
    }
}

/// In-memory writer for exercising stages without an HTTP transport.
#[cfg(test)]
pub(crate) struct MemoryWriter {
    pub headers: Mutex<Vec<(String, String)>>,
    pub events: Mutex<Vec<String>>,
}

#[cfg(test)]
impl MemoryWriter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            headers: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().expect("events lock").clone()
    }

    pub fn header(&self, key: &str) -> Option<String> {
        self.headers
            .lock()
            .expect("headers lock")
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }
}

#[cfg(test)]
#[async_trait]
impl SseWriter for MemoryWriter {
    fn set_header(&self, key: &str, value: &str) {
        self.headers
            .lock()
            .expect("headers lock")
            .push((key.to_string(), value.to_string()));
    }

    async fn write_event(&self, data: &[u8]) -> Result<()> {
        self.events
            .lock()
            .expect("events lock")
            .push(String::from_utf8_lossy(data).into_owned());
        Ok(())
    }

    async fn done(&self) -> Result<()> {
        self.events
            .lock()
            .expect("events lock")
            .push(crate::utils::sse::DONE_MARKER.to_string());
        Ok(())
    }
}
