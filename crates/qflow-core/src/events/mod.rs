//! Incremental decoder for `text/event-stream` bodies.
//!
//! The decoder is transport agnostic: feed it byte fragments of any size as
//! they arrive and it hands back every event completed by that fragment.
//! Lines may end in `\n`, `\r\n` or a bare `\r`, and both line terminators
//! and multi-byte UTF-8 sequences may be split across fragments.

use std::mem;

/// Event type used when a block carries no `event:` field.
pub const DEFAULT_EVENT: &str = "message";

const BOM: &[u8] = b"\xEF\xBB\xBF";

/// A dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type
    pub event: String,
    /// Data lines joined with `\n`
    pub data: String,
    /// Last event id seen on the stream, if any
    pub id: Option<String>,
    /// Reconnection delay in milliseconds requested by this block
    pub retry: Option<u64>,
}

impl SseEvent {
    /// Deserialize the data as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is not valid JSON for `T`.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> crate::Result<T> {
        Ok(serde_json::from_str(&self.data)?)
    }
}

/// Stateful event-stream decoder.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    line: Vec<u8>,
    after_cr: bool,
    started: bool,
    event: Option<String>,
    data: Vec<String>,
    retry: Option<u64>,
    last_id: Option<String>,
}

impl EventStreamDecoder {
    /// Create a decoder at the start of a stream.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The sticky last event id.
    #[must_use]
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_id.as_deref()
    }

    /// Consume a fragment and return the events it completed, in order.
    pub fn feed(&mut self, mut chunk: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();

        if !self.started {
            let wanted = BOM.len().saturating_sub(self.line.len());
            self.line.extend_from_slice(&chunk[..wanted.min(chunk.len())]);
            chunk = &chunk[wanted.min(chunk.len())..];
            if self.line.len() < BOM.len() && BOM.starts_with(&self.line) {
                return events;
            }
            self.started = true;
            let head = mem::take(&mut self.line);
            let head = head.strip_prefix(BOM).unwrap_or(&head);
            self.consume(head, &mut events);
        }

        self.consume(chunk, &mut events);
        events
    }

    /// End of stream.
    ///
    /// A trailing event without its terminating blank line is dropped.
    /// Returns whether anything was discarded. The decoder is reset and can
    /// read a new stream; the last event id survives.
    pub fn finish(&mut self) -> bool {
        let discarded = !self.line.is_empty() || !self.data.is_empty() || self.event.is_some();
        self.line.clear();
        self.data.clear();
        self.event = None;
        self.retry = None;
        self.after_cr = false;
        self.started = false;
        discarded
    }

    fn consume(&mut self, mut bytes: &[u8], events: &mut Vec<SseEvent>) {
        while !bytes.is_empty() {
            if self.after_cr {
                self.after_cr = false;
                if bytes[0] == b'\n' {
                    bytes = &bytes[1..];
                    continue;
                }
            }

            match bytes.iter().position(|&b| b == b'\n' || b == b'\r') {
                Some(pos) => {
                    self.line.extend_from_slice(&bytes[..pos]);
                    self.after_cr = bytes[pos] == b'\r';
                    bytes = &bytes[pos + 1..];

                    let line = mem::take(&mut self.line);
                    if let Some(event) = self.process_line(&String::from_utf8_lossy(&line)) {
                        events.push(event);
                    }
                }
                None => {
                    self.line.extend_from_slice(bytes);
                    break;
                }
            }
        }
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" if !value.contains('\0') => self.last_id = Some(value.to_string()),
            "retry" if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) => {
                self.retry = value.parse().ok();
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        let retry = self.retry.take();
        if self.data.is_empty() {
            return None;
        }

        Some(SseEvent {
            event: event.unwrap_or_else(|| DEFAULT_EVENT.to_string()),
            data: mem::take(&mut self.data).join("\n"),
            id: self.last_id.clone(),
            retry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(fragments: &[&[u8]]) -> Vec<SseEvent> {
        let mut decoder = EventStreamDecoder::new();
        fragments.iter().flat_map(|f| decoder.feed(f)).collect()
    }

    #[test]
    fn test_basic_event() {
        let events = decode_all(&[b"event: progress\ndata: {\"progress\":10}\n\n"]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "progress");
        assert_eq!(events[0].data, "{\"progress\":10}");
        assert_eq!(events[0].id, None);
    }

    #[test]
    fn test_fragmented_byte_by_byte() {
        let stream = b"event: complete\r\ndata: a\r\ndata: b\r\n\r\n";
        let fragments: Vec<&[u8]> = stream.chunks(1).collect();
        let events = decode_all(&fragments);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "complete");
        assert_eq!(events[0].data, "a\nb");
    }

    #[test]
    fn test_crlf_split_across_fragments() {
        let events = decode_all(&[b"data: one\r", b"\n\r", b"\ndata: two\r\n\r\n"]);
        let data: Vec<&str> = events.iter().map(|e| e.data.as_str()).collect();
        assert_eq!(data, ["one", "two"]);
    }

    #[test]
    fn test_bare_cr_line_endings() {
        let events = decode_all(&[b"data: x\r\rdata: y\r\r"]);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_utf8_split_across_fragments() {
        let text = "data: héllo ✓\n\n".as_bytes();
        let (a, b) = text.split_at(8);
        let events = decode_all(&[a, b]);
        assert_eq!(events[0].data, "héllo ✓");
    }

    #[test]
    fn test_comments_and_unknown_fields() {
        let events = decode_all(&[b": keepalive\n\nfoo: bar\ndata\n\n"]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "");
        assert_eq!(events[0].event, DEFAULT_EVENT);
    }

    #[test]
    fn test_event_without_data_is_not_dispatched() {
        let events = decode_all(&[b"event: ping\n\ndata: after\n\n"]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, DEFAULT_EVENT);
    }

    #[test]
    fn test_id_is_sticky_and_retry_needs_digits() {
        let mut decoder = EventStreamDecoder::new();
        let events = decoder.feed(b"id: 7\nretry: 1500\ndata: a\n\nretry: 1s\ndata: b\n\n");
        assert_eq!(events[0].id.as_deref(), Some("7"));
        assert_eq!(events[0].retry, Some(1500));
        assert_eq!(events[1].id.as_deref(), Some("7"));
        assert_eq!(events[1].retry, None);
        assert_eq!(decoder.last_event_id(), Some("7"));
    }

    #[test]
    fn test_leading_bom_is_skipped() {
        let events = decode_all(&[b"\xEF\xBB", b"\xBFdata: x\n\n"]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn test_finish_drops_unterminated_event() {
        let mut decoder = EventStreamDecoder::new();
        assert!(decoder.feed(b"data: partial\n").is_empty());
        assert!(decoder.finish());
        assert!(!decoder.finish());
        assert_eq!(decoder.feed(b"data: next\n\n")[0].data, "next");
    }

    #[test]
    fn test_json_payload() {
        #[derive(serde::Deserialize)]
        struct Progress {
            progress: u8,
        }
        let events = decode_all(&[b"data: {\"progress\":42}\n\n"]);
        assert_eq!(events[0].json::<Progress>().unwrap().progress, 42);
    }
}
