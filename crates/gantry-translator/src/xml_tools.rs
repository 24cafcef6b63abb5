//! XML-embedded tool call extraction
//!
//! Some model families ignore the native `tool_calls` wire format and emit
//! tool invocations as an XML block inside their text output:
//!
//! ```text
//! <function_calls>
//! <invoke name="bash">
//! <parameter name="command">ls</parameter>
//! </invoke>
//! </function_calls>
//! ```
//!
//! The scanner consumes streamed text deltas, holds back anything that could
//! be the start of such a block, and once a complete well-formed block
//! arrives, yields one synthetic tool call per `<invoke>` with the block
//! excised from the surrounding text. Output preserves document order as a
//! segment list, so text before a block stays before its tool calls.
//! Incomplete blocks stay held until more text arrives; whatever is still
//! held at stream end is surfaced as text.

use crate::adapters::{ExtractedToolCall, OutputSegment};
use serde_json::Value;

const OPEN_TAG: &str = "<function_calls>";
const CLOSE_TAG: &str = "</function_calls>";

/// Result of feeding one delta through the scanner.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Emittable output in document order: text runs and extracted calls
    pub segments: Vec<OutputSegment>,
    /// True when at least one block was excised by this push
    pub matched: bool,
}

impl ScanOutcome {
    fn text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        // Merge adjacent text runs
        if let Some(OutputSegment::Text(last)) = self.segments.last_mut() {
            last.push_str(text);
        } else {
            self.segments.push(OutputSegment::Text(text.to_string()));
        }
    }
}

/// Streaming-safe scanner for `<function_calls>` blocks.
#[derive(Debug, Default)]
pub struct XmlToolScanner {
    held: String,
}

impl XmlToolScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next text delta; returns emittable segments.
    pub fn push(&mut self, delta: &str) -> ScanOutcome {
        self.held.push_str(delta);
        let mut out = ScanOutcome::default();

        loop {
            match self.held.find(OPEN_TAG) {
                Some(open_at) => {
                    let Some(close_rel) = self.held[open_at..].find(CLOSE_TAG) else {
                        // Block opened but not yet closed: emit the prefix, hold the rest
                        out.text(&self.held[..open_at]);
                        self.held.drain(..open_at);
                        return out;
                    };
                    let close_end = open_at + close_rel + CLOSE_TAG.len();

                    match parse_invokes(&self.held[open_at..close_end]) {
                        Some(calls) if !calls.is_empty() => {
                            let prefix = self.held[..open_at].to_string();
                            out.text(&prefix);
                            out.segments.extend(calls.into_iter().map(OutputSegment::ToolCall));
                            out.matched = true;
                        }
                        // Malformed block: pass through as text untouched
                        _ => {
                            let raw = self.held[..close_end].to_string();
                            out.text(&raw);
                        }
                    }
                    self.held.drain(..close_end);
                }
                None => {
                    // Nothing resembling a block: emit everything except a
                    // trailing fragment that could still grow into the open tag
                    let keep_from = self.held.len() - partial_tag_suffix(&self.held);
                    let emit = self.held[..keep_from].to_string();
                    out.text(&emit);
                    self.held.drain(..keep_from);
                    return out;
                }
            }
        }
    }

    /// Surface whatever is still held (incomplete block) as plain text.
    pub fn flush(&mut self) -> String {
        std::mem::take(&mut self.held)
    }

    pub fn reset(&mut self) {
        self.held.clear();
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of the
/// open tag (so `"foo <func"` holds back `"<func"`).
fn partial_tag_suffix(text: &str) -> usize {
    let max = OPEN_TAG.len().min(text.len());
    for len in (1..=max).rev() {
        if len < OPEN_TAG.len() && text.ends_with(&OPEN_TAG[..len]) {
            return len;
        }
    }
    0
}

/// Parse every `<invoke>` in a complete block. Returns `None` when the block
/// is malformed (an invoke without a name or without its closing tag).
fn parse_invokes(block: &str) -> Option<Vec<ExtractedToolCall>> {
    let mut calls = Vec::new();
    let mut rest = block;

    while let Some(at) = rest.find("<invoke") {
        rest = &rest[at..];
        let tag_end = rest.find('>')?;
        let name = attr_value(&rest[..tag_end + 1], "name")?;

        let body_start = tag_end + 1;
        let body_end = rest.find("</invoke>")?;
        if body_end < body_start {
            return None;
        }
        let body = &rest[body_start..body_end];

        let mut arguments = serde_json::Map::new();
        let mut params = body;
        while let Some(p) = params.find("<parameter") {
            params = &params[p..];
            let p_tag_end = params.find('>')?;
            let p_name = attr_value(&params[..p_tag_end + 1], "name")?;
            let value_start = p_tag_end + 1;
            let value_end = params.find("</parameter>")?;
            if value_end < value_start {
                return None;
            }
            arguments.insert(p_name, Value::String(params[value_start..value_end].to_string()));
            params = &params[value_end + "</parameter>".len()..];
        }

        calls.push(ExtractedToolCall {
            name,
            arguments: Value::Object(arguments),
        });
        rest = &rest[body_end + "</invoke>".len()..];
    }

    Some(calls)
}

/// Extract `key="value"` from an XML open tag.
fn attr_value(tag: &str, key: &str) -> Option<String> {
    let needle = format!("{}=\"", key);
    let at = tag.find(&needle)?;
    let rest = &tag[at + needle.len()..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text_of(outcome: &ScanOutcome) -> String {
        outcome
            .segments
            .iter()
            .filter_map(|s| match s {
                OutputSegment::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    fn calls_of(outcome: &ScanOutcome) -> Vec<&ExtractedToolCall> {
        outcome
            .segments
            .iter()
            .filter_map(|s| match s {
                OutputSegment::ToolCall(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn extracts_single_invoke_preserving_order() {
        let mut scanner = XmlToolScanner::new();
        let out = scanner.push(
            "I'll run it.\n<function_calls>\n<invoke name=\"bash\">\n<parameter name=\"command\">ls</parameter>\n</invoke>\n</function_calls>\nDone.",
        );

        assert!(out.matched);
        assert_eq!(out.segments.len(), 3);
        assert!(matches!(&out.segments[0], OutputSegment::Text(t) if t == "I'll run it.\n"));
        let OutputSegment::ToolCall(call) = &out.segments[1] else {
            panic!("expected tool call in the middle");
        };
        assert_eq!(call.name, "bash");
        assert_eq!(call.arguments, json!({"command": "ls"}));
        assert!(matches!(&out.segments[2], OutputSegment::Text(t) if t == "\nDone."));
    }

    #[test]
    fn extracts_multiple_invokes_in_order() {
        let mut scanner = XmlToolScanner::new();
        let out = scanner.push(
            "<function_calls><invoke name=\"a\"><parameter name=\"x\">1</parameter></invoke><invoke name=\"b\"><parameter name=\"y\">2</parameter></invoke></function_calls>",
        );

        let calls = calls_of(&out);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "a");
        assert_eq!(calls[1].name, "b");
        assert_eq!(calls[1].arguments, json!({"y": "2"}));
        assert!(text_of(&out).is_empty());
    }

    #[test]
    fn holds_incomplete_block_across_deltas() {
        let mut scanner = XmlToolScanner::new();

        let out = scanner.push("text <function_calls><invoke name=\"bash\">");
        assert_eq!(text_of(&out), "text ");
        assert!(calls_of(&out).is_empty());

        let out = scanner
            .push("<parameter name=\"command\">ls</parameter></invoke></function_calls> after");
        assert_eq!(calls_of(&out).len(), 1);
        assert_eq!(text_of(&out), " after");
    }

    #[test]
    fn holds_partial_open_tag() {
        let mut scanner = XmlToolScanner::new();
        let out = scanner.push("hello <func");
        assert_eq!(text_of(&out), "hello ");

        // Turns out it wasn't a block after all
        let out = scanner.push("tion pointer");
        assert_eq!(text_of(&out), "<function pointer");
    }

    #[test]
    fn flush_surfaces_incomplete_block_as_text() {
        let mut scanner = XmlToolScanner::new();
        scanner.push("before <function_calls><invoke name=\"x\">");
        assert_eq!(scanner.flush(), "<function_calls><invoke name=\"x\">");
    }

    #[test]
    fn malformed_block_passes_through_as_text() {
        let mut scanner = XmlToolScanner::new();
        // Invoke missing its name attribute
        let out = scanner.push("<function_calls><invoke></invoke></function_calls>");
        assert!(calls_of(&out).is_empty());
        assert_eq!(text_of(&out), "<function_calls><invoke></invoke></function_calls>");
    }

    #[test]
    fn round_trip_residual_equals_original_minus_block() {
        let original = "alpha <function_calls><invoke name=\"t\"><parameter name=\"k\">v</parameter></invoke></function_calls> omega";
        let mut scanner = XmlToolScanner::new();
        let out = scanner.push(original);
        assert_eq!(text_of(&out), "alpha  omega");
        let calls = calls_of(&out);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments, json!({"k": "v"}));
    }
}
