//! Server-sent events decoder
//!
//! Incremental decoder for `text/event-stream` bodies. Chunks may split
//! lines (and UTF-8 sequences) anywhere; complete events are returned as
//! soon as their terminating blank line arrives. Lines end at CRLF, LF or
//! a bare CR.

use tracing::debug;

/// Longest line kept; longer lines are dropped whole
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// One dispatched event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// `event:` field, `None` means the default "message" type
    pub event: Option<String>,
    /// `data:` lines joined with `\n`
    pub data: String,
}

/// Incremental `text/event-stream` decoder
#[derive(Debug, Default)]
pub struct SseDecoder {
    /// Bytes of the current unfinished line
    line: Vec<u8>,
    /// Current line went past [`MAX_LINE_BYTES`]
    overlong: bool,
    /// Last byte was a CR, so a following LF closes nothing
    after_cr: bool,
    data: Vec<String>,
    event: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returns every event it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();
        for &byte in chunk {
            match byte {
                b'\n' if self.after_cr => self.after_cr = false,
                b'\r' | b'\n' => {
                    self.after_cr = byte == b'\r';
                    if let Some(event) = self.end_line() {
                        events.push(event);
                    }
                }
                _ => {
                    self.after_cr = false;
                    if self.overlong {
                        continue;
                    }
                    if self.line.len() >= MAX_LINE_BYTES {
                        debug!("Dropping event-stream line over {} bytes", MAX_LINE_BYTES);
                        self.line = Vec::new();
                        self.overlong = true;
                    } else {
                        self.line.push(byte);
                    }
                }
            }
        }
        events
    }

    fn end_line(&mut self) -> Option<SseEvent> {
        let line = std::mem::take(&mut self.line);
        if std::mem::take(&mut self.overlong) {
            return None;
        }
        self.process_line(&String::from_utf8_lossy(&line))
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
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            // id / retry carry nothing we act on
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent { event, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_event() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"data: {\"rooms\": {}}\n\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: None,
                data: "{\"rooms\": {}}".to_string()
            }]
        );
    }

    #[test]
    fn test_split_chunks_and_crlf() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"da").is_empty());
        assert!(decoder.push(b"ta: first\r").is_empty());
        assert!(decoder.push(b"\n").is_empty());
        let events = decoder.push(b"\r\ndata: second\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "first");
        assert_eq!(events[1].data, "second");
    }

    #[test]
    fn test_multiline_data_and_event_name() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"event: rooms\ndata: a\ndata: b\n\n");
        assert_eq!(events[0].event.as_deref(), Some("rooms"));
        assert_eq!(events[0].data, "a\nb");
    }

    #[test]
    fn test_comments_and_empty_events_are_skipped() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b": keep-alive\n\nid: 7\n\nretry: 1000\ndata:x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn test_bare_cr_line_endings() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"data: a\r\rdata: b\r");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "a");
        let events = decoder.push(b"\r");
        assert_eq!(events[0].data, "b");
    }

    #[test]
    fn test_overlong_line_is_dropped() {
        let mut decoder = SseDecoder::new();
        let mut flood = b"data: ".to_vec();
        flood.resize(MAX_LINE_BYTES * 3, b'x');
        assert!(decoder.push(&flood).is_empty());
        assert!(decoder.line.capacity() <= MAX_LINE_BYTES * 2);

        // The oversized line is discarded, the stream carries on
        let events = decoder.push(b"\n\ndata: ok\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "ok");
    }

    #[test]
    fn test_utf8_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        let payload = "data: Zoë\n\n".as_bytes();
        let (a, b) = payload.split_at(9);
        assert!(decoder.push(a).is_empty());
        let events = decoder.push(b);
        assert_eq!(events[0].data, "Zoë");
    }
}
