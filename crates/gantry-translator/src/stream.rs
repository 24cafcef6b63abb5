//! Stream translator: OpenAI chunks -> Anthropic stream events
//!
//! One translator instance lives per inbound request. It owns the block
//! table and walks a small state machine:
//!
//! ```text
//! NEW -> STREAMING -> (ENDED | ERRORED)
//! ```
//!
//! `start` emits the response header (`message_start` + `ping`), `on_payload`
//! translates one upstream SSE payload, and `finish`/`fail` seal the stream.
//! The caller writes the returned events in order; nothing is emitted out of
//! band.

use crate::adapters::{ExtractedToolCall, ModelAdapter};
use gantry_core::anthropic::{
    ContentBlockStart, ContentDelta, DeltaUsage, ErrorData, MessageDeltaData, MessageStart, Role,
    StopReason, StreamEvent, Usage,
};
use gantry_core::openai::{ChatCompletionChunk, ChunkToolCall, FinishReason};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    New,
    Streaming,
    Ended,
    Errored,
}

/// One tool_use block in flight.
#[derive(Debug)]
struct ToolBlock {
    /// Anthropic content-block index
    index: usize,
    id: String,
    name: String,
    /// Concatenated argument fragments, exactly as received
    args: String,
    closed: bool,
}

/// Block bookkeeping for one streamed message.
///
/// Indices are assigned monotonically and never reused. At most one text and
/// one reasoning block are open at a time; tool blocks live in an arena in
/// start order, addressed by the upstream tool-call index.
#[derive(Debug, Default)]
pub struct BlockTable {
    next_index: usize,
    text_open: Option<usize>,
    reasoning_open: Option<usize>,
    tools: Vec<ToolBlock>,
    by_upstream: HashMap<usize, usize>,
    /// Argument fragments that arrived before the tool's name; flushed once
    /// the name shows up, never turned into an invented tool call
    pending_args: HashMap<usize, String>,
}

impl BlockTable {
    fn allocate(&mut self) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    /// Indices of every still-open block, in the order they were opened.
    fn open_indices(&self) -> Vec<usize> {
        let mut open: Vec<usize> = Vec::new();
        if let Some(i) = self.reasoning_open {
            open.push(i);
        }
        if let Some(i) = self.text_open {
            open.push(i);
        }
        open.extend(self.tools.iter().filter(|t| !t.closed).map(|t| t.index));
        open.sort_unstable();
        open
    }
}

/// Per-request streaming translator.
pub struct StreamTranslator {
    model: String,
    message_id: String,
    adapter: Box<dyn ModelAdapter>,
    table: BlockTable,
    phase: Phase,
    stop_reason: Option<StopReason>,
    usage: Option<gantry_core::openai::Usage>,
    accumulated_text: String,
    synthetic_seq: usize,
}

impl StreamTranslator {
    pub fn new(model: &str, adapter: Box<dyn ModelAdapter>) -> Self {
        Self {
            model: model.to_string(),
            message_id: generate_message_id(),
            adapter,
            table: BlockTable::default(),
            phase: Phase::New,
            stop_reason: None,
            usage: None,
            accumulated_text: String::new(),
            synthetic_seq: 0,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Whether the response header has been emitted yet. Decides error
    /// surfacing: HTTP status before, SSE `error` event after.
    pub fn started(&self) -> bool {
        self.phase != Phase::New
    }

    /// Final prompt-token count from the upstream, once known.
    pub fn prompt_tokens(&self) -> u32 {
        self.usage.map(|u| u.prompt_tokens).unwrap_or(0)
    }

    /// Override the recorded stop reason before sealing the stream. Used by
    /// the dispatcher when the request deadline expires mid-stream.
    pub fn set_stop_reason(&mut self, reason: StopReason) {
        self.stop_reason = Some(reason);
    }

    /// Emit the response header: `message_start` with placeholder usage,
    /// then a `ping`.
    pub fn start(&mut self) -> Vec<StreamEvent> {
        debug_assert_eq!(self.phase, Phase::New);
        self.phase = Phase::Streaming;
        vec![
            StreamEvent::MessageStart {
                message: MessageStart {
                    id: self.message_id.clone(),
                    message_type: "message".to_string(),
                    role: Role::Assistant,
                    content: vec![],
                    model: self.model.clone(),
                    stop_reason: None,
                    usage: Usage { input_tokens: 0, output_tokens: 0 },
                },
            },
            StreamEvent::Ping,
        ]
    }

    /// Translate one upstream SSE data payload. Payloads that fail to parse
    /// are logged and skipped; upstreams emit partial JSON during retries.
    pub fn on_payload(&mut self, data: &str) -> Vec<StreamEvent> {
        match serde_json::from_str::<ChatCompletionChunk>(data) {
            Ok(chunk) => self.on_chunk(&chunk),
            Err(e) => {
                warn!("skipping unparseable upstream chunk: {} ({})", e, truncate(data, 200));
                Vec::new()
            }
        }
    }

    /// Translate one parsed upstream chunk.
    pub fn on_chunk(&mut self, chunk: &ChatCompletionChunk) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if self.phase != Phase::Streaming {
            return out;
        }

        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }

        let Some(choice) = chunk.choices.first() else {
            return out;
        };
        let delta = &choice.delta;

        if let Some(reasoning) = delta.reasoning() {
            self.emit_reasoning(reasoning, &mut out);
        }

        if let Some(content) = delta.content.as_deref().filter(|c| !c.is_empty()) {
            let processed = self.adapter.process_text_content(content, &self.accumulated_text);
            self.accumulated_text.push_str(content);

            for segment in processed.segments {
                match segment {
                    crate::adapters::OutputSegment::Text(text) if !text.is_empty() => {
                        self.emit_text(&text, &mut out)
                    }
                    crate::adapters::OutputSegment::Text(_) => {}
                    crate::adapters::OutputSegment::ToolCall(call) => {
                        self.emit_synthetic_tool(call, &mut out)
                    }
                }
            }
        }

        if let Some(tool_calls) = &delta.tool_calls {
            for tc in tool_calls {
                self.emit_tool_delta(tc, &mut out);
            }
        }

        if let Some(finish) = choice.finish_reason {
            self.on_finish_reason(finish, &mut out);
        }

        out
    }

    /// Seal the stream after `[DONE]` or upstream EOF: close every open
    /// block in open order, then `message_delta` and `message_stop`.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if self.phase != Phase::Streaming {
            return out;
        }

        // Text an adapter held back (e.g. an unterminated XML block) is
        // surfaced as ordinary text
        let held = self.adapter.flush_text();
        if !held.is_empty() {
            self.emit_text(&held, &mut out);
        }
        if !self.table.pending_args.is_empty() {
            warn!(
                "dropping buffered arguments for {} nameless tool call(s)",
                self.table.pending_args.len()
            );
            self.table.pending_args.clear();
        }

        self.close_open_blocks(&mut out);

        out.push(StreamEvent::MessageDelta {
            delta: MessageDeltaData {
                stop_reason: Some(self.stop_reason.unwrap_or(StopReason::EndTurn)),
                stop_sequence: None,
            },
            usage: DeltaUsage {
                output_tokens: self.usage.map(|u| u.completion_tokens).unwrap_or(0),
            },
        });
        out.push(StreamEvent::MessageStop);
        self.phase = Phase::Ended;
        out
    }

    /// Seal the stream after a mid-stream upstream failure: best-effort close
    /// of open blocks, then an `error` event.
    pub fn fail(&mut self, message: &str) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if self.phase != Phase::Streaming {
            return out;
        }
        self.close_open_blocks(&mut out);
        out.push(StreamEvent::Error {
            error: ErrorData {
                error_type: "api_error".to_string(),
                message: message.to_string(),
            },
        });
        self.phase = Phase::Errored;
        out
    }

    // ------------------------------------------------------------------
    // Block lifecycle
    // ------------------------------------------------------------------

    fn emit_reasoning(&mut self, text: &str, out: &mut Vec<StreamEvent>) {
        let index = match self.table.reasoning_open {
            Some(index) => index,
            None => {
                let index = self.table.allocate();
                self.table.reasoning_open = Some(index);
                out.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: ContentBlockStart::Thinking { thinking: String::new() },
                });
                index
            }
        };
        out.push(StreamEvent::ContentBlockDelta {
            index,
            delta: ContentDelta::ThinkingDelta { thinking: text.to_string() },
        });
    }

    fn emit_text(&mut self, text: &str, out: &mut Vec<StreamEvent>) {
        self.close_reasoning(out);
        let index = match self.table.text_open {
            Some(index) => index,
            None => {
                let index = self.table.allocate();
                self.table.text_open = Some(index);
                out.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: ContentBlockStart::Text { text: String::new() },
                });
                index
            }
        };
        out.push(StreamEvent::ContentBlockDelta {
            index,
            delta: ContentDelta::TextDelta { text: text.to_string() },
        });
    }

    /// A complete tool call recovered from model text: emitted as a closed
    /// start/delta/stop triple at a fresh index.
    fn emit_synthetic_tool(&mut self, call: ExtractedToolCall, out: &mut Vec<StreamEvent>) {
        self.close_reasoning(out);
        self.close_text(out);

        let index = self.table.allocate();
        let id = self.generate_tool_id();
        let args = serde_json::to_string(&call.arguments).unwrap_or_else(|_| "{}".to_string());

        out.push(StreamEvent::ContentBlockStart {
            index,
            content_block: ContentBlockStart::ToolUse {
                id: id.clone(),
                name: call.name.clone(),
                input: serde_json::json!({}),
            },
        });
        out.push(StreamEvent::ContentBlockDelta {
            index,
            delta: ContentDelta::InputJsonDelta { partial_json: args.clone() },
        });
        out.push(StreamEvent::ContentBlockStop { index });

        self.table.tools.push(ToolBlock { index, id, name: call.name, args, closed: true });
    }

    fn emit_tool_delta(&mut self, tc: &ChunkToolCall, out: &mut Vec<StreamEvent>) {
        let args = tc
            .function
            .as_ref()
            .and_then(|f| f.arguments.as_deref())
            .filter(|a| !a.is_empty());

        if let Some(&slot) = self.table.by_upstream.get(&tc.index) {
            if let Some(args) = args {
                if self.table.tools[slot].closed {
                    warn!(
                        "argument delta for closed tool block (upstream index {}); table: {:?}",
                        tc.index, self.table
                    );
                    return;
                }
                let tool = &mut self.table.tools[slot];
                tool.args.push_str(args);
                out.push(StreamEvent::ContentBlockDelta {
                    index: tool.index,
                    delta: ContentDelta::InputJsonDelta { partial_json: args.to_string() },
                });
            }
            return;
        }

        let name = tc.function.as_ref().and_then(|f| f.name.clone());
        let Some(name) = name else {
            // No name yet: buffer the fragments rather than inventing a tool
            if let Some(args) = args {
                self.table
                    .pending_args
                    .entry(tc.index)
                    .or_default()
                    .push_str(args);
                debug!("buffering {} argument bytes for nameless tool call", args.len());
            }
            return;
        };

        // A tool block starts: any open text/reasoning block stops first and
        // is not reopened (later text starts a fresh, higher-indexed block)
        self.close_reasoning(out);
        self.close_text(out);

        let index = self.table.allocate();
        let id = tc.id.clone().unwrap_or_else(|| self.generate_tool_id());
        out.push(StreamEvent::ContentBlockStart {
            index,
            content_block: ContentBlockStart::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: serde_json::json!({}),
            },
        });

        let mut tool = ToolBlock { index, id, name, args: String::new(), closed: false };
        if let Some(buffered) = self.table.pending_args.remove(&tc.index) {
            tool.args.push_str(&buffered);
            out.push(StreamEvent::ContentBlockDelta {
                index,
                delta: ContentDelta::InputJsonDelta { partial_json: buffered },
            });
        }
        if let Some(args) = args {
            tool.args.push_str(args);
            out.push(StreamEvent::ContentBlockDelta {
                index,
                delta: ContentDelta::InputJsonDelta { partial_json: args.to_string() },
            });
        }

        self.table.by_upstream.insert(tc.index, self.table.tools.len());
        self.table.tools.push(tool);
    }

    fn on_finish_reason(&mut self, finish: FinishReason, out: &mut Vec<StreamEvent>) {
        self.close_open_blocks(out);
        self.stop_reason = Some(match finish {
            FinishReason::Stop => StopReason::EndTurn,
            FinishReason::Length => StopReason::MaxTokens,
            FinishReason::ToolCalls | FinishReason::FunctionCall => StopReason::ToolUse,
            FinishReason::ContentFilter => StopReason::StopSequence,
        });
    }

    fn close_reasoning(&mut self, out: &mut Vec<StreamEvent>) {
        if let Some(index) = self.table.reasoning_open.take() {
            out.push(StreamEvent::ContentBlockStop { index });
        }
    }

    fn close_text(&mut self, out: &mut Vec<StreamEvent>) {
        if let Some(index) = self.table.text_open.take() {
            out.push(StreamEvent::ContentBlockStop { index });
        }
    }

    fn close_open_blocks(&mut self, out: &mut Vec<StreamEvent>) {
        for index in self.table.open_indices() {
            out.push(StreamEvent::ContentBlockStop { index });
        }
        self.table.reasoning_open = None;
        self.table.text_open = None;
        for tool in self.table.tools.iter_mut().filter(|t| !t.closed) {
            tool.closed = true;
            if !tool.args.is_empty() && serde_json::from_str::<serde_json::Value>(&tool.args).is_err()
            {
                warn!(
                    "tool block {} ({}) closed with malformed argument JSON: {}",
                    tool.index,
                    tool.name,
                    truncate(&tool.args, 200)
                );
            }
        }
    }

    fn generate_tool_id(&mut self) -> String {
        let id = format!("tool_{}_{}", unix_millis(), self.synthetic_seq);
        self.synthetic_seq += 1;
        id
    }
}

fn generate_message_id() -> String {
    let rand = &uuid::Uuid::new_v4().simple().to_string()[..12];
    format!("msg_{}_{}", unix_millis(), rand)
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::DefaultAdapter;
    use serde_json::json;

    fn translator() -> StreamTranslator {
        StreamTranslator::new("test-model", Box::new(DefaultAdapter))
    }

    fn chunk(v: serde_json::Value) -> ChatCompletionChunk {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn start_emits_header_and_ping() {
        let mut t = translator();
        let events = t.start();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], StreamEvent::MessageStart { .. }));
        assert!(matches!(events[1], StreamEvent::Ping));
        assert!(t.started());
    }

    #[test]
    fn message_id_shape() {
        let t = translator();
        assert!(t.message_id().starts_with("msg_"));
        assert_eq!(t.message_id().split('_').count(), 3);
    }

    #[test]
    fn text_block_opens_once() {
        let mut t = translator();
        t.start();

        let first = t.on_chunk(&chunk(json!({"choices": [{"delta": {"content": "He"}}]})));
        assert_eq!(first.len(), 2);
        assert!(matches!(
            first[0],
            StreamEvent::ContentBlockStart { index: 0, .. }
        ));

        let second = t.on_chunk(&chunk(json!({"choices": [{"delta": {"content": "llo"}}]})));
        assert_eq!(second.len(), 1);
        assert!(matches!(
            &second[0],
            StreamEvent::ContentBlockDelta { index: 0, delta: ContentDelta::TextDelta { text } } if text == "llo"
        ));
    }

    #[test]
    fn reasoning_closes_when_text_arrives() {
        let mut t = translator();
        t.start();

        t.on_chunk(&chunk(json!({"choices": [{"delta": {"reasoning_content": "let me think"}}]})));
        let events = t.on_chunk(&chunk(json!({"choices": [{"delta": {"content": "answer"}}]})));

        assert!(matches!(events[0], StreamEvent::ContentBlockStop { index: 0 }));
        assert!(matches!(events[1], StreamEvent::ContentBlockStart { index: 1, .. }));
    }

    #[test]
    fn nameless_deltas_buffer_until_name_arrives() {
        let mut t = translator();
        t.start();

        // Argument fragment with no name: nothing emitted
        let early = t.on_chunk(&chunk(json!({
            "choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "function": {"arguments": "{\"a\":"}}
            ]}}]
        })));
        assert!(early.is_empty());

        // Name arrives: start, then the buffered fragment, then the new one
        let late = t.on_chunk(&chunk(json!({
            "choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"name": "calc", "arguments": "1}"}}
            ]}}]
        })));
        assert_eq!(late.len(), 3);
        assert!(matches!(late[0], StreamEvent::ContentBlockStart { index: 0, .. }));
        let StreamEvent::ContentBlockDelta { delta: ContentDelta::InputJsonDelta { partial_json }, .. } = &late[1] else {
            panic!("expected buffered delta");
        };
        assert_eq!(partial_json, "{\"a\":");
    }

    #[test]
    fn finish_reports_tool_use_and_usage() {
        let mut t = translator();
        t.start();
        t.on_chunk(&chunk(json!({
            "choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_42", "function": {"name": "get_weather", "arguments": "{}"}}
            ]}}]
        })));
        t.on_chunk(&chunk(json!({
            "choices": [{"delta": {}, "finish_reason": "tool_calls"}],
            "usage": {"prompt_tokens": 7, "completion_tokens": 3}
        })));

        let tail = t.finish();
        let StreamEvent::MessageDelta { delta, usage } = &tail[0] else {
            panic!("expected message_delta first, got {:?}", tail[0]);
        };
        assert_eq!(delta.stop_reason, Some(StopReason::ToolUse));
        assert_eq!(usage.output_tokens, 3);
        assert!(matches!(tail[1], StreamEvent::MessageStop));
        assert_eq!(t.prompt_tokens(), 7);
    }

    #[test]
    fn finish_is_idempotent() {
        let mut t = translator();
        t.start();
        t.on_chunk(&chunk(json!({"choices": [{"delta": {"content": "x"}, "finish_reason": "stop"}]})));
        assert!(!t.finish().is_empty());
        assert!(t.finish().is_empty());
    }

    #[test]
    fn unparseable_payload_skipped() {
        let mut t = translator();
        t.start();
        assert!(t.on_payload("{not json").is_empty());
        // Stream continues afterwards
        let events = t.on_payload("{\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}");
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn content_filter_maps_to_stop_sequence() {
        let mut t = translator();
        t.start();
        t.on_chunk(&chunk(json!({
            "choices": [{"delta": {"content": "x"}, "finish_reason": "content_filter"}]
        })));
        let tail = t.finish();
        let StreamEvent::MessageDelta { delta, .. } = &tail[0] else {
            panic!("expected message_delta");
        };
        assert_eq!(delta.stop_reason, Some(StopReason::StopSequence));
    }

    #[test]
    fn fail_closes_blocks_then_emits_error() {
        let mut t = translator();
        t.start();
        t.on_chunk(&chunk(json!({"choices": [{"delta": {"content": "partial"}}]})));

        let events = t.fail("upstream reset");
        assert!(matches!(events[0], StreamEvent::ContentBlockStop { index: 0 }));
        let StreamEvent::Error { error } = &events[1] else {
            panic!("expected error event");
        };
        assert_eq!(error.error_type, "api_error");
    }
}
