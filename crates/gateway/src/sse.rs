//! Minimal SSE framing for backend event streams.
//!
//! The shim emits the standard `event:`/`data:` line framing with one JSON
//! payload per data line. We only need those two fields; comments and unknown
//! fields are ignored.

/// One parsed `event:`/`data:` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Incremental decoder for the SSE wire framing.
///
/// Feed raw chunks as they arrive from the network; complete `data:` lines are
/// yielded together with the most recent `event:` name. Partial lines are
/// buffered until the terminating newline shows up in a later chunk.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: String,
    event: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));

        let mut frames = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            let line = line.trim();
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            if let Some(rest) = line.strip_prefix("event:") {
                self.event = rest.trim_start().to_string();
            } else if let Some(rest) = line.strip_prefix("data:") {
                frames.push(SseFrame {
                    event: self.event.clone(),
                    data: rest.trim_start().to_string(),
                });
            }
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(event: &str, data: &str) -> SseFrame {
        SseFrame {
            event: event.to_string(),
            data: data.to_string(),
        }
    }

    #[test]
    fn decodes_a_single_event() {
        let mut dec = SseDecoder::new();
        let frames = dec.push(b"event: endpoint\ndata: /message\n\n");
        assert_eq!(frames, vec![frame("endpoint", "/message")]);
    }

    #[test]
    fn reassembles_lines_split_across_chunks() {
        let mut dec = SseDecoder::new();
        assert!(dec.push(b"event: mess").is_empty());
        assert!(dec.push(b"age\ndata: {\"id\"").is_empty());
        let frames = dec.push(b":7}\n\n");
        assert_eq!(frames, vec![frame("message", "{\"id\":7}")]);
    }

    #[test]
    fn tolerates_crlf_and_comments() {
        let mut dec = SseDecoder::new();
        let frames = dec.push(b": keepalive\r\nevent: message\r\ndata: x\r\n\r\n");
        assert_eq!(frames, vec![frame("message", "x")]);
    }

    #[test]
    fn event_name_carries_over_between_data_lines() {
        let mut dec = SseDecoder::new();
        let frames = dec.push(b"event: message\ndata: a\n\ndata: b\n\n");
        assert_eq!(frames, vec![frame("message", "a"), frame("message", "b")]);
    }
}
