//! Server-Sent Events parsing for remote provider streams
//!
//! Remote backends stream completions as SSE over HTTP. The parser here
//! turns raw response bytes into discrete events; the remote adapter maps
//! those onto [`StreamDelta`](super::StreamDelta)s.

use futures::{Stream, StreamExt};

use super::{ErrorKind, ProviderError};

/// One parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub data: String,
}

/// Incremental parser over arbitrary byte chunk boundaries.
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    /// Feed one chunk of bytes; returns every event completed by it.
    pub fn parse_chunk(&mut self, chunk: &[u8]) -> Result<Vec<SseEvent>, ProviderError> {
        let text = std::str::from_utf8(chunk).map_err(|e| {
            ProviderError::new(
                ErrorKind::InvalidResponse,
                format!("invalid UTF-8 in event stream: {}", e),
            )
        })?;
        self.buffer.push_str(text);

        let mut events = Vec::new();
        // Events are separated by a blank line.
        while let Some(boundary) = self.buffer.find("\n\n") {
            let block = self.buffer[..boundary].to_string();
            self.buffer.drain(..boundary + 2);
            if !block.trim().is_empty() {
                events.push(parse_event_block(&block));
            }
        }
        Ok(events)
    }
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_event_block(block: &str) -> SseEvent {
    let mut event_type = None;
    let mut data_lines = Vec::new();

    for line in block.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        match line.split_once(':') {
            Some(("event", value)) => event_type = Some(value.trim_start().to_string()),
            Some(("data", value)) => data_lines.push(value.trim_start().to_string()),
            Some(_) => {}
            None => data_lines.push(line.to_string()),
        }
    }

    SseEvent {
        event_type,
        data: data_lines.join("\n"),
    }
}

/// Flatten an HTTP response body into a stream of SSE events.
pub fn response_to_sse_stream(
    response: reqwest::Response,
) -> impl Stream<Item = Result<SseEvent, ProviderError>> + Send {
    let byte_stream = response.bytes_stream();
    let mut parser = SseParser::new();

    byte_stream
        .map(move |chunk_result| match chunk_result {
            Ok(chunk) => parser.parse_chunk(&chunk).map(futures::stream::iter),
            Err(e) => Err(ProviderError::new(ErrorKind::Unavailable, e.to_string())),
        })
        .flat_map(|events| match events {
            Ok(iter) => iter.map(Ok).boxed(),
            Err(e) => futures::stream::once(async move { Err(e) }).boxed(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_event() {
        let mut parser = SseParser::new();
        let events = parser
            .parse_chunk(b"data: {\"delta\":\"hi\"}\n\n")
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"delta\":\"hi\"}");
        assert_eq!(events[0].event_type, None);
    }

    #[test]
    fn parses_event_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.parse_chunk(b"data: par").unwrap().is_empty());
        let events = parser.parse_chunk(b"tial\n\n").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "partial");
    }

    #[test]
    fn parses_typed_events_and_comments() {
        let mut parser = SseParser::new();
        let events = parser
            .parse_chunk(b": keepalive\nevent: done\ndata: [DONE]\n\n")
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type.as_deref(), Some("done"));
        assert_eq!(events[0].data, "[DONE]");
    }

    #[test]
    fn multiple_events_in_one_chunk() {
        let mut parser = SseParser::new();
        let events = parser.parse_chunk(b"data: a\n\ndata: b\n\n").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "a");
        assert_eq!(events[1].data, "b");
    }

    #[test]
    fn rejects_invalid_utf8() {
        let mut parser = SseParser::new();
        let err = parser.parse_chunk(&[0xff, 0xfe]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidResponse);
    }

    #[test]
    fn multiline_data_joined() {
        let mut parser = SseParser::new();
        let events = parser.parse_chunk(b"data: line1\ndata: line2\n\n").unwrap();
        assert_eq!(events[0].data, "line1\nline2");
    }
}
