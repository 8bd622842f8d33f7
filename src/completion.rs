//! Streaming client for OpenAI-compatible chat-completion endpoints.
//!
//! Opens a server-sent-event connection and surfaces the response as an
//! ordered, finite sequence of [`StreamEvent`]s that the caller consumes
//! one at a time. The stream ends with exactly one terminal event.

use async_stream::stream;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Config;
use crate::conversation::Message;

/// In-band end-of-stream sentinel sent as a literal event payload.
const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("no API key configured; set TOGETHER_API_KEY or api_key in the config file")]
    MissingApiKey,

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("endpoint returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// One event of the completion stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// An incremental fragment of assistant text.
    Delta(String),
    /// The endpoint signalled end-of-stream, or the connection closed cleanly.
    Done,
    /// The exchange failed mid-stream. Content already folded in is kept.
    Failed(String),
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: &'a [Message],
    stream_tokens: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
}

/// Typed shape of one streamed event payload. Anything that fails to decode
/// into this is a malformed payload and aborts the exchange.
#[derive(Deserialize)]
struct CompletionChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
}

#[derive(Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Client for a chat-completions endpoint speaking the SSE streaming
/// protocol (`stream_tokens: true`).
#[derive(Clone)]
pub struct CompletionClient {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    stop: Vec<String>,
}

impl CompletionClient {
    pub fn new(config: &Config) -> Result<Self, CompletionError> {
        let api_key = config
            .resolve_api_key()
            .ok_or(CompletionError::MissingApiKey)?;

        Ok(Self {
            client: reqwest::Client::new(),
            url: config.base_url.clone(),
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            stop: config.stop.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Request a completion for the given context and return the event
    /// stream.
    ///
    /// A non-success status is a terminal failure surfaced here, before any
    /// event is produced. On success the returned stream yields fragments in
    /// network order followed by exactly one [`StreamEvent::Done`] or
    /// [`StreamEvent::Failed`]. No retries.
    pub async fn stream_chat(
        &self,
        messages: &[Message],
    ) -> Result<impl Stream<Item = StreamEvent> + Send + 'static, CompletionError> {
        let request = CompletionRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages,
            stream_tokens: true,
            stop: if self.stop.is_empty() {
                None
            } else {
                Some(&self.stop)
            },
        };

        let response = self
            .client
            .post(&self.url)
            .header("Accept", "text/event-stream")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::Status { status, body });
        }

        Ok(sse_events(response.bytes_stream()))
    }
}

/// Outcome of dispatching one accumulated SSE data payload.
enum Dispatch {
    Delta(String),
    Done,
    Malformed(String),
}

/// Accumulates `data:` lines until a blank line dispatches the payload,
/// per the SSE framing rules.
#[derive(Default)]
struct SseParser {
    data: String,
}

impl SseParser {
    /// Feed one decoded line. A blank line dispatches accumulated data.
    fn feed_line(&mut self, line: &str) -> Option<Dispatch> {
        if line.is_empty() {
            return self.dispatch();
        }

        if let Some(payload) = line.strip_prefix("data:") {
            if !self.data.is_empty() {
                self.data.push('\n');
            }
            self.data.push_str(payload.strip_prefix(' ').unwrap_or(payload));
        }
        // `event:`, `id:` and comment lines carry nothing we consume.

        None
    }

    /// Dispatch the accumulated payload, if any.
    fn dispatch(&mut self) -> Option<Dispatch> {
        let data = std::mem::take(&mut self.data);
        if data.is_empty() {
            return None;
        }
        if data == DONE_SENTINEL {
            return Some(Dispatch::Done);
        }

        let chunk: CompletionChunk = match serde_json::from_str(&data) {
            Ok(chunk) => chunk,
            Err(e) => return Some(Dispatch::Malformed(format!("malformed event payload: {e}"))),
        };

        // The fragment lives in the first choice's delta. Payloads without
        // a content fragment (role-only preludes, keep-alives) produce no
        // event.
        let fragment = chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
            .unwrap_or_default();

        if fragment.is_empty() {
            None
        } else {
            Some(Dispatch::Delta(fragment))
        }
    }
}

/// Parse a raw SSE byte stream into [`StreamEvent`]s.
///
/// Bytes are buffered into lines across chunk boundaries. The `[DONE]`
/// sentinel, a clean close, a transport error and a malformed payload are
/// all terminal; whichever comes first ends the stream.
fn sse_events<B, E>(
    bytes: impl Stream<Item = Result<B, E>> + Send + 'static,
) -> impl Stream<Item = StreamEvent> + Send + 'static
where
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display + Send,
{
    stream! {
        let mut bytes = std::pin::pin!(bytes);
        let mut parser = SseParser::default();
        let mut line_buf = String::new();

        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield StreamEvent::Failed(format!("stream read error: {e}"));
                    return;
                }
            };
            let text = match std::str::from_utf8(chunk.as_ref()) {
                Ok(text) => text,
                Err(e) => {
                    yield StreamEvent::Failed(format!("invalid UTF-8 in stream: {e}"));
                    return;
                }
            };

            // Append to the line buffer and process every complete line,
            // keeping an unterminated tail for the next chunk.
            line_buf.push_str(text);
            while let Some(newline_pos) = line_buf.find('\n') {
                let line = line_buf[..newline_pos].trim_end_matches('\r').to_string();
                line_buf.drain(..=newline_pos);

                match parser.feed_line(&line) {
                    Some(Dispatch::Delta(fragment)) => yield StreamEvent::Delta(fragment),
                    Some(Dispatch::Done) => {
                        yield StreamEvent::Done;
                        return;
                    }
                    Some(Dispatch::Malformed(reason)) => {
                        yield StreamEvent::Failed(reason);
                        return;
                    }
                    None => {}
                }
            }
        }

        // Connection closed without the sentinel: flush the unterminated
        // tail, dispatch whatever payload is pending, and treat the close
        // as an implicit end of stream.
        let tail = line_buf.trim_end_matches('\r').to_string();
        if !tail.is_empty() {
            let _ = parser.feed_line(&tail);
        }
        match parser.dispatch() {
            Some(Dispatch::Delta(fragment)) => yield StreamEvent::Delta(fragment),
            Some(Dispatch::Done) => {
                yield StreamEvent::Done;
                return;
            }
            Some(Dispatch::Malformed(reason)) => {
                yield StreamEvent::Failed(reason);
                return;
            }
            None => {}
        }
        yield StreamEvent::Done;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::convert::Infallible;

    fn delta_line(fragment: &str) -> String {
        format!(
            "data: {{\"choices\":[{{\"delta\":{{\"content\":{}}}}}]}}\n\n",
            serde_json::to_string(fragment).unwrap()
        )
    }

    async fn collect_ok(chunks: Vec<String>) -> Vec<StreamEvent> {
        let bytes = stream::iter(chunks.into_iter().map(Ok::<_, Infallible>));
        sse_events(bytes).collect().await
    }

    #[tokio::test]
    async fn fragments_arrive_in_order_then_done() {
        let body = format!(
            "{}{}data: [DONE]\n\n",
            delta_line("Hi"),
            delta_line(" there")
        );
        let events = collect_ok(vec![body]).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Delta("Hi".to_string()),
                StreamEvent::Delta(" there".to_string()),
                StreamEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn lines_split_across_chunks_are_reassembled() {
        let events = collect_ok(vec![
            "data: {\"choices\":[{\"del".to_string(),
            "ta\":{\"content\":\"Hel".to_string(),
            "lo\"}}]}\n\ndata: [DONE]\n\n".to_string(),
        ])
        .await;
        assert_eq!(
            events,
            vec![StreamEvent::Delta("Hello".to_string()), StreamEvent::Done]
        );
    }

    #[tokio::test]
    async fn crlf_line_endings_are_accepted() {
        let events = collect_ok(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\r\n\r\ndata: [DONE]\r\n\r\n"
                .to_string(),
        ])
        .await;
        assert_eq!(
            events,
            vec![StreamEvent::Delta("Hi".to_string()), StreamEvent::Done]
        );
    }

    #[tokio::test]
    async fn nothing_is_consumed_after_the_sentinel() {
        let body = format!(
            "{}data: [DONE]\n\n{}",
            delta_line("kept"),
            delta_line("dropped")
        );
        let events = collect_ok(vec![body]).await;
        assert_eq!(
            events,
            vec![StreamEvent::Delta("kept".to_string()), StreamEvent::Done]
        );
    }

    #[tokio::test]
    async fn close_without_sentinel_is_an_implicit_end() {
        let events = collect_ok(vec![delta_line("partial")]).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Delta("partial".to_string()),
                StreamEvent::Done
            ]
        );
    }

    #[tokio::test]
    async fn unterminated_tail_is_flushed_at_close() {
        // Final data line lacks both its newline and the dispatching blank
        // line; the close must still deliver it.
        let events = collect_ok(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"tail\"}}]}".to_string(),
        ])
        .await;
        assert_eq!(
            events,
            vec![StreamEvent::Delta("tail".to_string()), StreamEvent::Done]
        );
    }

    #[tokio::test]
    async fn malformed_payload_aborts_the_exchange() {
        let body = format!(
            "{}data: {{not json\n\n{}",
            delta_line("ok"),
            delta_line("never")
        );
        let events = collect_ok(vec![body]).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamEvent::Delta("ok".to_string()));
        assert!(
            matches!(&events[1], StreamEvent::Failed(reason) if reason.contains("malformed")),
            "got {:?}",
            events[1]
        );
    }

    #[tokio::test]
    async fn missing_delta_field_is_malformed() {
        let events =
            collect_ok(vec!["data: {\"choices\":[{\"message\":{}}]}\n\n".to_string()]).await;
        assert!(matches!(&events[0], StreamEvent::Failed(_)));
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn role_only_prelude_produces_no_event() {
        let events = collect_ok(vec![
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\ndata: [DONE]\n\n"
                .to_string(),
        ])
        .await;
        assert_eq!(events, vec![StreamEvent::Done]);
    }

    #[tokio::test]
    async fn transport_error_fails_the_exchange() {
        let bytes = stream::iter(vec![
            Ok::<&str, String>("data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n"),
            Err("connection reset".to_string()),
        ]);
        let events: Vec<StreamEvent> = sse_events(bytes).collect().await;
        assert_eq!(events[0], StreamEvent::Delta("Hi".to_string()));
        assert!(
            matches!(&events[1], StreamEvent::Failed(reason) if reason.contains("connection reset"))
        );
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn data_prefix_without_space_is_accepted() {
        let mut parser = SseParser::default();
        let _ = parser.feed_line("data:{\"choices\":[{\"delta\":{\"content\":\"x\"}}]}");
        match parser.feed_line("") {
            Some(Dispatch::Delta(fragment)) => assert_eq!(fragment, "x"),
            _ => panic!("expected a delta"),
        }
    }

    #[test]
    fn non_data_fields_are_ignored() {
        let mut parser = SseParser::default();
        assert!(parser.feed_line(": keep-alive comment").is_none());
        assert!(parser.feed_line("event: completion").is_none());
        assert!(parser.feed_line("id: 42").is_none());
        assert!(parser.feed_line("").is_none());
    }
}
