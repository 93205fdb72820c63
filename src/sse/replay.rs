use crate::error::Result;
use crate::types::{ChatResponse, ChatStreamChunk, Delta, StreamChoice, unix_now};

use super::{SseWriter, write_json};

/// Replays a complete buffered response as the minimal SSE stream a
/// streaming client expects: a role chunk, one content chunk per choice,
/// a terminal chunk carrying `finish_reason: "stop"` and the stored usage,
/// then the `[DONE]` sentinel.
///
/// The stored buffered response is authoritative; this does not reproduce
/// whatever chunking the provider originally streamed.
pub async fn write_response_as_sse(sw: &dyn SseWriter, resp: &ChatResponse) -> Result<()> {
    let created = unix_now();

    let mut role_chunk = ChatStreamChunk::new(&resp.id, created, &resp.model);
    role_chunk.choices.push(StreamChoice {
        index: 0,
        delta: Delta {
            role: "assistant".to_string(),
            content: String::new(),
        },
        finish_reason: None,
    });
    write_json(sw, &role_chunk).await?;

    for choice in &resp.choices {
        let mut content_chunk = ChatStreamChunk::new(&resp.id, created, &resp.model);
        content_chunk.choices.push(StreamChoice {
            index: choice.index,
            delta: Delta {
                role: String::new(),
                content: choice.message.content.clone(),
            },
            finish_reason: None,
        });
        write_json(sw, &content_chunk).await?;
    }

    let mut finish_chunk = ChatStreamChunk::new(&resp.id, created, &resp.model);
    finish_chunk.choices.push(StreamChoice {
        index: 0,
        delta: Delta::default(),
        finish_reason: Some("stop".to_string()),
    });
    finish_chunk.usage = Some(resp.usage);
    write_json(sw, &finish_chunk).await?;

    sw.done().await
}
