// src/sse.rs
//
// Server-Sent Events. A handler builds events and returns them as a
// chunked stream; the content type is set automatically.
//
// Wire format, one blank-line-terminated block per event:
//
//   event: <type>
//   id: <id>
//   retry: <milliseconds>
//   data: <line>
//   data: <line>
//

use crate::http::{Body, ChunkSource, Response};

#[derive(Debug, Clone, Default)]
pub struct SseEvent {
    event: Option<String>,
    id: Option<String>,
    retry: Option<u64>,
    data: Vec<String>,
    comment: Option<String>,
}

impl SseEvent {
    /// An event carrying `data`, split into one `data:` line per newline.
    pub fn new(data: impl Into<String>) -> Self {
        SseEvent {
            data: data.into().lines().map(|l| l.to_string()).collect(),
            ..Default::default()
        }
    }

    /// A comment-only event; keeps the connection alive without
    /// delivering anything to listeners.
    pub fn comment(text: impl Into<String>) -> Self {
        SseEvent {
            comment: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn event(mut self, event_type: impl Into<String>) -> Self {
        self.event = Some(event_type.into());
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn retry(mut self, millis: u64) -> Self {
        self.retry = Some(millis);
        self
    }

    pub fn format(&self) -> Vec<u8> {
        let mut out = String::new();
        if let Some(ref c) = self.comment {
            out.push_str(": ");
            out.push_str(c);
            out.push('\n');
        }
        if let Some(ref e) = self.event {
            out.push_str("event: ");
            out.push_str(e);
            out.push('\n');
        }
        if let Some(ref id) = self.id {
            out.push_str("id: ");
            out.push_str(id);
            out.push('\n');
        }
        if let Some(retry) = self.retry {
            out.push_str("retry: ");
            out.push_str(&retry.to_string());
            out.push('\n');
        }
        for line in &self.data {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out.into_bytes()
    }
}

/// Build an event-stream response from a generator of events. Each event
/// leaves as its own chunk.
pub fn sse_response<I>(events: I) -> Response
where
    I: Iterator<Item = SseEvent> + 'static,
{
    let source: Box<dyn ChunkSource> = Box::new(events.map(|e| e.format()));
    let mut resp = Response::new(200);
    resp.headers.set("Content-Type", "text/event-stream");
    resp.headers.set("Cache-Control", "no-cache");
    resp.body = Body::Stream(source);
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_event_format() {
        let e = SseEvent::new("line1\nline2").event("update").id("7").retry(1500);
        let s = String::from_utf8(e.format()).unwrap();
        assert_eq!(
            s,
            "event: update\nid: 7\nretry: 1500\ndata: line1\ndata: line2\n\n"
        );
    }

    #[test]
    fn test_comment_event() {
        let e = SseEvent::comment("keep-alive");
        assert_eq!(e.format(), b": keep-alive\n\n");
    }

    #[test]
    fn test_response_content_type() {
        let resp = sse_response(std::iter::once(SseEvent::new("x")));
        assert_eq!(resp.headers.get("Content-Type"), Some("text/event-stream"));
        assert!(matches!(resp.body, Body::Stream(_)));
    }
}
