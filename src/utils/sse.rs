use futures_util::TryStreamExt;
use futures_util::stream::{self, BoxStream};
use tokio::io::AsyncBufReadExt;
use tokio_util::io::StreamReader;

use crate::error::{ProxyError, Result};

/// Terminal sentinel emitted by OpenAI-style streams.
pub const DONE_MARKER: &str = "[DONE]";

const MAX_LINE_BYTES: usize = 256 * 1024;

/// One upstream SSE frame: a `data:` payload plus the most recent
/// `event:` line seen before it (Anthropic's dialect types its events;
/// OpenAI and Gemini leave `event` unset).
#[derive(Clone, Debug)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn is_done(&self) -> bool {
        self.data == DONE_MARKER
    }
}

/// Reads an upstream response body line by line and yields SSE frames.
/// Each `data:` line is its own frame; blank lines do not reset the
/// tracked event type.
pub fn frame_stream(response: reqwest::Response) -> BoxStream<'static, Result<SseFrame>> {
    let reader = StreamReader::new(
        response
            .bytes_stream()
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err)),
    );
    frame_stream_from_reader(reader)
}

fn frame_stream_from_reader<R>(reader: R) -> BoxStream<'static, Result<SseFrame>>
where
    R: tokio::io::AsyncBufRead + Send + Unpin + 'static,
{
    let lines = reader.lines();

    Box::pin(stream::try_unfold(
        (lines, None::<String>),
        |(mut lines, mut event)| async move {
            loop {
                let Some(line) = lines.next_line().await? else {
                    return Ok(None);
                };
                if line.len() > MAX_LINE_BYTES {
                    return Err(ProxyError::InvalidResponse(format!(
                        "SSE line exceeds {MAX_LINE_BYTES} bytes"
                    )));
                }
                let line = line.trim_end_matches('\r');
                if line.is_empty() {
                    continue;
                }

                if let Some(rest) = line.strip_prefix("event:") {
                    event = Some(rest.trim_start().to_string());
                    continue;
                }

                if let Some(rest) = line.strip_prefix("data:") {
                    let frame = SseFrame {
                        event: event.clone(),
                        data: rest.trim_start().to_string(),
                    };
                    return Ok(Some((frame, (lines, event))));
                }
            }
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tokio::io::BufReader;

    async fn frames_from(input: &'static str) -> Vec<SseFrame> {
        frame_stream_from_reader(BufReader::new(input.as_bytes()))
            .map(|frame| frame.expect("frame"))
            .collect()
            .await
    }

    #[tokio::test]
    async fn parses_untyped_data_frames() {
        let frames = frames_from("data: {\"a\":1}\n\ndata: [DONE]\n\n").await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, "{\"a\":1}");
        assert!(frames[0].event.is_none());
        assert!(frames[1].is_done());
    }

    #[tokio::test]
    async fn tracks_event_type_across_blank_lines() {
        let input = concat!(
            "event: message_start\n",
            "data: {\"x\":1}\n",
            "\n",
            "data: {\"x\":2}\n",
            "\n",
            "event: message_stop\n",
            "data: {}\n",
            "\n",
        );
        let frames = frames_from(input).await;
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].event.as_deref(), Some("message_start"));
        // No new event line before the second data line: the type carries over.
        assert_eq!(frames[1].event.as_deref(), Some("message_start"));
        assert_eq!(frames[2].event.as_deref(), Some("message_stop"));
    }

    #[tokio::test]
    async fn ignores_comment_and_unknown_lines() {
        let frames = frames_from(": keep-alive\nretry: 100\ndata: x\n\n").await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "x");
    }

    #[tokio::test]
    async fn handles_crlf_line_endings() {
        let frames = frames_from("data: a\r\n\r\ndata: b\r\n\r\n").await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, "a");
        assert_eq!(frames[1].data, "b");
    }
}
