//! Server-sent-event decoding.
//!
//! The transport receives SSE frames in two places: the long-lived
//! GET stream (chunked, so events can arrive split across reads) and
//! POST response bodies whose content-type is `text/event-stream`
//! (complete, one or more events). Both feed through [`SseDecoder`].
//!
//! Events are terminated by a blank line. Within one event, multiple
//! `data:` lines are joined with `\n`; `event:` sets the event type
//! (default `message`); `id:`, `retry:`, and comment lines are
//! ignored.

/// One decoded SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event_type: String,
    pub data: String,
}

impl SseEvent {
    /// Whether this is a `message` event carrying a JSON-RPC payload.
    pub fn is_message(&self) -> bool {
        self.event_type == "message"
    }
}

/// Incremental SSE decoder. Partial trailing data is retained across
/// [`feed`](Self::feed) calls.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every complete event from the buffer.
    /// Events with no `data:` payload (keep-alive comments, bare ids)
    /// are dropped.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..pos).collect();
            self.buffer.drain(..2); // the blank-line terminator
            if let Some(event) = parse_event(&block) {
                events.push(event);
            }
        }
        events
    }

    /// Decode whatever remains in the buffer as a final event. Called
    /// when the stream closes without a trailing blank line.
    pub fn flush(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        if rest.trim().is_empty() {
            return None;
        }
        parse_event(&rest)
    }
}

/// Decode a complete SSE body (e.g. a POST response) in one pass.
pub fn decode_body(body: &str) -> Vec<SseEvent> {
    let mut decoder = SseDecoder::new();
    let mut events = decoder.feed(body);
    events.extend(decoder.flush());
    events
}

fn parse_event(block: &str) -> Option<SseEvent> {
    let mut event_type = "message".to_string();
    let mut data_lines: Vec<&str> = Vec::new();

    for line in block.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event_type = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim());
        }
        // id:, retry:, and ":"-comments are intentionally ignored.
    }

    let data = data_lines.join("\n");
    if data.is_empty() {
        return None;
    }

    Some(SseEvent { event_type, data })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_complete_event() {
        let mut d = SseDecoder::new();
        let events = d.feed("event: message\ndata: {\"hello\":\"world\"}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "message");
        assert_eq!(events[0].data, "{\"hello\":\"world\"}");
    }

    #[test]
    fn multiple_events_in_one_chunk() {
        let mut d = SseDecoder::new();
        let events = d.feed("data: first\n\ndata: second\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "first");
        assert_eq!(events[1].data, "second");
    }

    #[test]
    fn partial_event_retained_across_feeds() {
        let mut d = SseDecoder::new();
        assert!(d.feed("data: par").is_empty());
        let events = d.feed("tial\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "partial");
    }

    #[test]
    fn event_split_exactly_at_terminator() {
        let mut d = SseDecoder::new();
        assert!(d.feed("data: x\n").is_empty());
        let events = d.feed("\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn multi_line_data_joined_with_newline() {
        let mut d = SseDecoder::new();
        let events = d.feed("data: line1\ndata: line2\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn default_event_type_is_message() {
        let mut d = SseDecoder::new();
        let events = d.feed("data: x\n\n");
        assert!(events[0].is_message());
    }

    #[test]
    fn custom_event_type_preserved() {
        let mut d = SseDecoder::new();
        let events = d.feed("event: endpoint\ndata: /mcp\n\n");
        assert_eq!(events[0].event_type, "endpoint");
        assert!(!events[0].is_message());
    }

    #[test]
    fn ignores_id_retry_and_comments() {
        let mut d = SseDecoder::new();
        let events = d.feed(": keep-alive\nid: 42\nretry: 5000\ndata: payload\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "payload");
    }

    #[test]
    fn dataless_event_dropped() {
        let mut d = SseDecoder::new();
        assert!(d.feed(": ping\n\n").is_empty());
        assert!(d.feed("id: 9\n\n").is_empty());
    }

    #[test]
    fn flush_recovers_unterminated_tail() {
        let mut d = SseDecoder::new();
        assert!(d.feed("data: tail").is_empty());
        let event = d.flush().unwrap();
        assert_eq!(event.data, "tail");
        assert!(d.flush().is_none());
    }

    #[test]
    fn decode_body_handles_complete_response() {
        let events = decode_body("event: message\ndata: {\"jsonrpc\":\"2.0\"}\n\n");
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn decode_body_without_trailing_terminator() {
        let events = decode_body("data: {\"jsonrpc\":\"2.0\"}");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"jsonrpc\":\"2.0\"}");
    }
}
