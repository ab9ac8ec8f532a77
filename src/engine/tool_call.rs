//! Tool-call marker detection and payload parsing.
//!
//! Models announce tool use by embedding `<tool_call>{…}</tool_call>` blocks
//! in their text stream. The scanner routes emitted pieces: text outside
//! marker pairs is forwarded verbatim, text inside is buffered until the
//! closing marker, and the buffered payload is parsed as JSON. Marker pairs
//! are non-overlapping: an open marker must close before another opens.

use serde_json::Value;
use uuid::Uuid;

use crate::conversation::ToolCall;

const OPEN_MARKER: &str = "<tool_call>";
const CLOSE_MARKER: &str = "</tool_call>";

/// One routed unit out of the scanner.
#[derive(Debug, PartialEq)]
pub(crate) enum Scanned {
    /// Text to forward to the consumer unchanged.
    Text(String),
    /// A complete, successfully parsed tool call.
    Call(ToolCall),
}

/// Streaming state machine over the decode loop's emitted pieces.
///
/// The close marker is searched in the accumulated buffer, so a close marker
/// split across pieces is still caught. Open markers are matched within a
/// single piece, which holds for the tokenizers this runtime targets: the
/// marker is a single vocabulary token.
#[derive(Default)]
pub(crate) struct ToolCallScanner {
    buffer: String,
    buffering: bool,
}

impl ToolCallScanner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Routes one emitted piece, returning forwardable text and any tool
    /// calls it completed.
    pub(crate) fn feed(&mut self, piece: &str) -> Vec<Scanned> {
        let mut out = Vec::new();

        if self.buffering {
            self.buffer.push_str(piece);
            self.drain_buffer(&mut out);
            if !self.buffering {
                let trailing = std::mem::take(&mut self.buffer);
                if !trailing.is_empty() {
                    out.extend(self.feed_owned(trailing));
                }
            }
            return out;
        }

        match piece.find(OPEN_MARKER) {
            Some(idx) => {
                if idx > 0 {
                    out.push(Scanned::Text(piece[..idx].to_string()));
                }
                self.buffering = true;
                self.buffer.push_str(&piece[idx + OPEN_MARKER.len()..]);
                self.drain_buffer(&mut out);
                if !self.buffering {
                    // The close marker was inside this same piece; keep
                    // scanning whatever trailed it (more markers included).
                    let trailing = std::mem::take(&mut self.buffer);
                    if !trailing.is_empty() {
                        out.extend(self.feed_owned(trailing));
                    }
                }
            }
            None => {
                if !piece.is_empty() {
                    out.push(Scanned::Text(piece.to_string()));
                }
            }
        }
        out
    }

    /// Called on end-of-generation: parses and returns a still-open buffer.
    pub(crate) fn flush(&mut self) -> Option<ToolCall> {
        if !self.buffering {
            return None;
        }
        self.buffering = false;
        let payload = std::mem::take(&mut self.buffer);
        parse_payload(&payload)
    }

    /// Whether an open marker is currently being buffered.
    pub(crate) fn is_buffering(&self) -> bool {
        self.buffering
    }

    fn drain_buffer(&mut self, out: &mut Vec<Scanned>) {
        if let Some(idx) = self.buffer.find(CLOSE_MARKER) {
            let after = self.buffer[idx + CLOSE_MARKER.len()..].to_string();
            self.buffer.truncate(idx);
            let payload = std::mem::take(&mut self.buffer);
            self.buffering = false;
            if let Some(call) = parse_payload(&payload) {
                out.push(Scanned::Call(call));
            }
            self.buffer = after;
        }
    }

    fn feed_owned(&mut self, text: String) -> Vec<Scanned> {
        self.feed(&text)
    }
}

/// Parses one buffered marker payload.
///
/// Expects `{"name": "...", "arguments": <object or JSON string>}`.
/// `arguments` as an object is re-serialized; as a string it is used as-is;
/// when absent it defaults to `"{}"`. Anything else — unparseable JSON, a
/// missing or non-string `name`, a non-object/non-string `arguments` — drops
/// the call silently and the stream continues.
pub(crate) fn parse_payload(payload: &str) -> Option<ToolCall> {
    let value: Value = match serde_json::from_str(payload.trim()) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!("discarding unparseable tool-call payload: {e}");
            return None;
        }
    };

    let name = match value.get("name").and_then(Value::as_str) {
        Some(n) => n.to_string(),
        None => {
            tracing::debug!("discarding tool-call payload without a name");
            return None;
        }
    };

    let arguments = match value.get("arguments") {
        None | Some(Value::Null) => "{}".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(obj @ Value::Object(_)) => serde_json::to_string(obj).unwrap_or_default(),
        Some(other) => {
            tracing::debug!(
                "discarding tool call '{name}': arguments have unsupported shape {other}"
            );
            return None;
        }
    };

    Some(ToolCall {
        id: Uuid::new_v4().to_string(),
        name,
        arguments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(items: &[Scanned]) -> Vec<&str> {
        items
            .iter()
            .filter_map(|i| match i {
                Scanned::Text(t) => Some(t.as_str()),
                Scanned::Call(_) => None,
            })
            .collect()
    }

    fn calls(items: &[Scanned]) -> Vec<&ToolCall> {
        items
            .iter()
            .filter_map(|i| match i {
                Scanned::Call(c) => Some(c),
                Scanned::Text(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_plain_text_forwarded_verbatim() {
        let mut scanner = ToolCallScanner::new();
        let items = scanner.feed("Hello, world");
        assert_eq!(texts(&items), vec!["Hello, world"]);
        assert!(!scanner.is_buffering());
    }

    #[test]
    fn test_call_with_object_arguments() {
        let mut scanner = ToolCallScanner::new();
        let mut items = scanner.feed(r#"<tool_call>{"name":"calculator","arguments":{"expression":"2+2"}}"#);
        assert!(items.is_empty());
        assert!(scanner.is_buffering());
        items = scanner.feed("</tool_call>");
        let found = calls(&items);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "calculator");
        let args: Value = serde_json::from_str(&found[0].arguments).unwrap();
        assert_eq!(args["expression"], "2+2");
        assert!(!found[0].id.is_empty());
    }

    #[test]
    fn test_call_with_string_arguments_used_as_is() {
        let mut scanner = ToolCallScanner::new();
        let piece =
            r#"<tool_call>{"name":"calculator","arguments":"{\"expression\":\"2+2\"}"}</tool_call>"#;
        let items = scanner.feed(piece);
        let found = calls(&items);
        assert_eq!(found[0].arguments, r#"{"expression":"2+2"}"#);
    }

    #[test]
    fn test_missing_arguments_default_to_empty_object() {
        let call = parse_payload(r#"{"name":"device_info"}"#).unwrap();
        assert_eq!(call.arguments, "{}");
    }

    #[test]
    fn test_buffered_text_never_forwarded() {
        let mut scanner = ToolCallScanner::new();
        let mut all = Vec::new();
        all.extend(scanner.feed("<tool_call>"));
        all.extend(scanner.feed(r#"{"name":"timer","#));
        all.extend(scanner.feed(r#""arguments":{}}"#));
        all.extend(scanner.feed("</tool_call>"));
        assert!(texts(&all).is_empty());
        assert_eq!(calls(&all).len(), 1);
    }

    #[test]
    fn test_text_around_markers_forwarded() {
        let mut scanner = ToolCallScanner::new();
        let items =
            scanner.feed(r#"before <tool_call>{"name":"timer"}</tool_call> after"#);
        assert_eq!(texts(&items), vec!["before ", " after"]);
        assert_eq!(calls(&items).len(), 1);
    }

    #[test]
    fn test_close_marker_split_across_pieces() {
        let mut scanner = ToolCallScanner::new();
        let mut all = Vec::new();
        all.extend(scanner.feed(r#"<tool_call>{"name":"timer"}</tool_"#));
        all.extend(scanner.feed("call>done"));
        assert_eq!(calls(&all).len(), 1);
        assert_eq!(texts(&all), vec!["done"]);
    }

    #[test]
    fn test_malformed_payload_dropped_and_stream_continues() {
        let mut scanner = ToolCallScanner::new();
        let mut all = Vec::new();
        all.extend(scanner.feed("<tool_call>not json at all</tool_call>"));
        all.extend(scanner.feed("still streaming"));
        assert!(calls(&all).is_empty());
        assert_eq!(texts(&all), vec!["still streaming"]);
        assert!(!scanner.is_buffering());
    }

    #[test]
    fn test_payload_without_name_dropped() {
        assert!(parse_payload(r#"{"arguments":{}}"#).is_none());
        assert!(parse_payload(r#"{"name":42}"#).is_none());
    }

    #[test]
    fn test_unsupported_arguments_shape_dropped() {
        assert!(parse_payload(r#"{"name":"t","arguments":[1,2]}"#).is_none());
        assert!(parse_payload(r#"{"name":"t","arguments":7}"#).is_none());
    }

    #[test]
    fn test_two_sequential_calls() {
        let mut scanner = ToolCallScanner::new();
        let items = scanner.feed(
            r#"<tool_call>{"name":"a"}</tool_call><tool_call>{"name":"b"}</tool_call>"#,
        );
        let found = calls(&items);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].name, "a");
        assert_eq!(found[1].name, "b");
    }

    #[test]
    fn test_flush_parses_open_buffer() {
        let mut scanner = ToolCallScanner::new();
        scanner.feed(r#"<tool_call>{"name":"calendar","arguments":{}}"#);
        let call = scanner.flush().unwrap();
        assert_eq!(call.name, "calendar");
        assert!(scanner.flush().is_none());
    }

    #[test]
    fn test_flush_without_open_buffer_is_none() {
        let mut scanner = ToolCallScanner::new();
        scanner.feed("just text");
        assert!(scanner.flush().is_none());
    }

    #[test]
    fn test_ids_are_unique_per_parse() {
        let a = parse_payload(r#"{"name":"t"}"#).unwrap();
        let b = parse_payload(r#"{"name":"t"}"#).unwrap();
        assert_ne!(a.id, b.id);
    }
}
