//! Incremental newline-delimited JSON parser for streamed chat responses.
//!
//! Each line is one JSON record. Records are classified into [`StreamEvent`]s;
//! a single record may carry several signals (thinking, delta, done, error),
//! which are emitted in that order.

use serde::Deserialize;
use serde_json::Value;
use shared::events::StreamEvent;

/// Which record shape the stream carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecordFormat {
    /// Suite API: `{"thinking"?, "delta"?, "done"?, "error"?}`
    #[default]
    Suite,
    /// Ollama `/api/chat`: `{"message": {"content", "thinking"?}, "done", "error"?}`
    Ollama,
}

#[derive(Debug, Deserialize)]
struct SuiteRecord {
    thinking: Option<String>,
    delta: Option<String>,
    done: Option<Value>,
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct OllamaStreamChunk {
    message: Option<OllamaStreamMessage>,
    done: Option<Value>,
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct OllamaStreamMessage {
    #[serde(default)]
    content: String,
    thinking: Option<String>,
}

impl RecordFormat {
    /// Classify one parsed line. `None` means the line was not a record of this format.
    fn classify(&self, line: &str) -> Option<Vec<StreamEvent>> {
        // Records are objects; serde would otherwise fill struct fields from an array.
        let value: Value = serde_json::from_str(line).ok()?;
        if !value.is_object() {
            return None;
        }
        let (thinking, delta, done, error) = match self {
            RecordFormat::Suite => {
                let r: SuiteRecord = serde_json::from_value(value).ok()?;
                (r.thinking, r.delta, r.done, r.error)
            }
            RecordFormat::Ollama => {
                let r: OllamaStreamChunk = serde_json::from_value(value).ok()?;
                let (content, thinking) = match r.message {
                    Some(m) => (Some(m.content), m.thinking),
                    None => (None, None),
                };
                (thinking, content, r.done, r.error)
            }
        };

        let mut events = Vec::new();
        if let Some(text) = thinking.filter(|t| !t.is_empty()) {
            events.push(StreamEvent::Thinking { text });
        }
        if let Some(text) = delta.filter(|t| !t.is_empty()) {
            events.push(StreamEvent::Delta { text });
        }
        if done.as_ref().is_some_and(is_truthy) {
            events.push(StreamEvent::Done);
        }
        if let Some(message) = error.as_ref().and_then(error_text) {
            events.push(StreamEvent::Error { message });
        }
        Some(events)
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn error_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Buffers raw bytes across reads and yields events for complete lines.
///
/// Bytes are split on `\n` before decoding, so a UTF-8 sequence cut by a
/// chunk boundary is reassembled before it is ever decoded.
pub struct LineParser {
    format: RecordFormat,
    buffer: Vec<u8>,
    finished: bool,
}

impl LineParser {
    pub fn new(format: RecordFormat) -> Self {
        Self {
            format,
            buffer: Vec::new(),
            finished: false,
        }
    }

    /// Feed one chunk. Returns events for every line it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        self.buffer.extend_from_slice(chunk);

        let Some(last_newline) = self.buffer.iter().rposition(|b| *b == b'\n') else {
            return events;
        };
        let remainder = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, remainder);

        for line in complete.split(|b| *b == b'\n') {
            self.parse_line(line, &mut events);
            if self.finished {
                break;
            }
        }
        events
    }

    /// Final pass over a trailing record that had no newline.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        let rest = std::mem::take(&mut self.buffer);
        if !self.finished {
            self.parse_line(&rest, &mut events);
        }
        events
    }

    /// True once a `Done` or `Error` has been produced.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn parse_line(&mut self, raw: &[u8], out: &mut Vec<StreamEvent>) {
        let text = String::from_utf8_lossy(raw);
        let line = text.trim();
        if line.is_empty() {
            return;
        }
        let Some(events) = self.format.classify(line) else {
            tracing::trace!(len = line.len(), "dropping malformed stream line");
            return;
        };
        for event in events {
            let terminal = event.is_terminal();
            out.push(event);
            if terminal {
                self.finished = true;
                self.buffer.clear();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(chunks: &[&[u8]]) -> Vec<StreamEvent> {
        let mut parser = LineParser::new(RecordFormat::Suite);
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(parser.feed(chunk));
        }
        events.extend(parser.finish());
        events
    }

    #[test]
    fn test_single_chunk() {
        let events = run(&[b"{\"delta\":\"Hel\"}\n{\"delta\":\"lo\"}\n{\"done\":true}\n"]);
        assert_eq!(
            events,
            vec![
                StreamEvent::delta("Hel"),
                StreamEvent::delta("lo"),
                StreamEvent::Done
            ]
        );
    }

    #[test]
    fn test_split_mid_line() {
        let events = run(&[b"{\"delta\":\"He", b"l\"}\n{\"done\":true}\n"]);
        assert_eq!(events, vec![StreamEvent::delta("Hel"), StreamEvent::Done]);
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let events = run(&[b"not json\n{\"delta\":\"ok\"}\n"]);
        assert_eq!(events, vec![StreamEvent::delta("ok")]);

        let events = run(&[b"{\"delta\":\"a\"}\n{broken\n\n  \n{\"delta\":\"b\"}\n[1,2\n"]);
        assert_eq!(events, vec![StreamEvent::delta("a"), StreamEvent::delta("b")]);
    }

    #[test]
    fn test_non_object_lines_are_skipped() {
        let events = run(&[b"[\"think\",\"delta\",true,null]\n{\"delta\":\"after\"}\n"]);
        assert_eq!(events, vec![StreamEvent::delta("after")]);

        let events = run(&[b"42\n\"done\"\nnull\ntrue\n[]\n{\"delta\":\"x\"}\n{\"done\":true}\n"]);
        assert_eq!(events, vec![StreamEvent::delta("x"), StreamEvent::Done]);

        let mut parser = LineParser::new(RecordFormat::Ollama);
        let events = parser.feed(b"[{\"content\":\"a\"},true]\n{\"message\":{\"content\":\"b\"}}\n");
        assert_eq!(events, vec![StreamEvent::delta("b")]);
        assert!(!parser.is_finished());
    }

    #[test]
    fn test_multi_signal_line() {
        let events = run(&[b"{\"thinking\":\"hmm\",\"delta\":\"hi\",\"done\":true}\n"]);
        assert_eq!(
            events,
            vec![
                StreamEvent::thinking("hmm"),
                StreamEvent::delta("hi"),
                StreamEvent::Done
            ]
        );
    }

    #[test]
    fn test_nothing_after_terminal() {
        let mut parser = LineParser::new(RecordFormat::Suite);
        let events = parser.feed(b"{\"error\":\"model not found\"}\n{\"delta\":\"x\"}\n");
        assert_eq!(events, vec![StreamEvent::error("model not found")]);
        assert!(parser.is_finished());
        assert!(parser.feed(b"{\"delta\":\"more\"}\n").is_empty());
        assert!(parser.finish().is_empty());

        // done then error on the same line: the error is never delivered
        let events = run(&[b"{\"delta\":\"a\",\"done\":true,\"error\":\"late\"}\n"]);
        assert_eq!(events, vec![StreamEvent::delta("a"), StreamEvent::Done]);
    }

    #[test]
    fn test_trailing_record_without_newline() {
        let events = run(&[b"{\"delta\":\"a\"}\n{\"delta\":\"b\"}"]);
        assert_eq!(events, vec![StreamEvent::delta("a"), StreamEvent::delta("b")]);
    }

    #[test]
    fn test_falsy_fields_emit_nothing() {
        let events = run(&[b"{\"delta\":\"\",\"thinking\":\"\",\"done\":false,\"error\":null}\n"]);
        assert!(events.is_empty());
        let events = run(&[b"{\"done\":1}\r\n"]);
        assert_eq!(events, vec![StreamEvent::Done]);
    }

    #[test]
    fn test_split_boundary_equivalence() {
        let input = "{\"thinking\":\"ü…\"}\n{\"delta\":\"héllo 🌍\"}\nnoise\n{\"delta\":\"日本\"}\n{\"done\":true}\n"
            .as_bytes();
        let expected = run(&[input]);
        assert_eq!(expected.len(), 4);

        for split in 0..=input.len() {
            let (a, b) = input.split_at(split);
            assert_eq!(run(&[a, b]), expected, "split at byte {}", split);
        }
        let singles: Vec<&[u8]> = input.chunks(1).collect();
        assert_eq!(run(&singles), expected);
        let threes: Vec<&[u8]> = input.chunks(3).collect();
        assert_eq!(run(&threes), expected);
    }

    #[test]
    fn test_ollama_records() {
        let mut parser = LineParser::new(RecordFormat::Ollama);
        let mut events = parser.feed(
            b"{\"message\":{\"role\":\"assistant\",\"content\":\"\",\"thinking\":\"plan\"},\"done\":false}\n\
              {\"message\":{\"role\":\"assistant\",\"content\":\"Hi\"},\"done\":false}\n",
        );
        events.extend(parser.feed(b"{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true}\n"));
        assert_eq!(
            events,
            vec![
                StreamEvent::thinking("plan"),
                StreamEvent::delta("Hi"),
                StreamEvent::Done
            ]
        );

        let mut parser = LineParser::new(RecordFormat::Ollama);
        let events = parser.feed(b"{\"error\":\"model 'x' not found\"}\n");
        assert_eq!(events, vec![StreamEvent::error("model 'x' not found")]);
    }
}
