use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::ready;
use futures::stream::Stream;

use weft_core::error::{Result, WeftError};

/// Incremental parser for `text/event-stream` bodies.
///
/// Bytes are buffered until a blank line closes an event, so chunks may split
/// lines or UTF-8 sequences anywhere.
#[derive(Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub data: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every event it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend(chunk.iter().filter(|b| **b != b'\r'));
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            let block = String::from_utf8_lossy(&block[..pos]);

            let mut event_type = None;
            let mut data_lines = Vec::new();
            for line in block.lines() {
                if let Some(val) = line.strip_prefix("event:") {
                    event_type = Some(val.trim_start().to_string());
                } else if let Some(val) = line.strip_prefix("data:") {
                    data_lines.push(val.strip_prefix(' ').unwrap_or(val));
                }
                // `:` comments (keep-alives) and `id:`/`retry:` fields are ignored
            }

            if !data_lines.is_empty() {
                events.push(SseEvent {
                    event_type,
                    data: data_lines.join("\n"),
                });
            }
        }

        events
    }
}

/// Stream of SSE events over a byte stream. Read errors surface as
/// `WeftError::Transport`.
pub struct SseStream<S> {
    inner: S,
    parser: SseParser,
    pending: VecDeque<SseEvent>,
}

impl<S> SseStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            parser: SseParser::new(),
            pending: VecDeque::new(),
        }
    }
}

impl<S, E> Stream for SseStream<S>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: Display,
{
    type Item = Result<SseEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(bytes)) => this.pending.extend(this.parser.feed(&bytes)),
                Some(Err(e)) => {
                    return Poll::Ready(Some(Err(WeftError::Transport(format!(
                        "event stream read failed: {}",
                        e
                    )))))
                }
                None => return Poll::Ready(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{stream, StreamExt};

    #[test]
    fn test_parser_basic() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"event: update\ndata: {\"state\":\"running\"}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type.as_deref(), Some("update"));
        assert_eq!(events[0].data, "{\"state\":\"running\"}");
    }

    #[test]
    fn test_parser_chunked_and_crlf() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"event: update\r\ndata: {\"x\":").is_empty());
        let events = parser.feed(b"1}\r\n\r\n: keep-alive\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"x\":1}");
    }

    #[test]
    fn test_parser_split_utf8() {
        let mut parser = SseParser::new();
        let body = "data: héllo\n\n".as_bytes();
        // split inside the two-byte 'é'
        assert!(parser.feed(&body[..8]).is_empty());
        let events = parser.feed(&body[8..]);
        assert_eq!(events[0].data, "héllo");
        assert_eq!(events[0].event_type, None);
    }

    #[tokio::test]
    async fn test_stream_surfaces_read_errors() {
        let chunks: Vec<std::result::Result<Bytes, String>> = vec![
            Ok(Bytes::from_static(b"data: a\n\ndata: b\n\n")),
            Err("reset by peer".to_string()),
        ];
        let items: Vec<_> = SseStream::new(stream::iter(chunks)).collect().await;
        assert_eq!(items.len(), 3);
        assert_eq!(items[1].as_ref().unwrap().data, "b");
        assert!(items[2].as_ref().unwrap_err().is_transport());
    }
}
