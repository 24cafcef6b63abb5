//! Model-family adapters
//!
//! An adapter customizes the outbound request for one upstream family and
//! post-processes its text deltas. Selection is a first-match linear scan
//! over the registry; the default (identity) adapter is always last.

use crate::normalize::CanonicalRequest;
use crate::xml_tools::XmlToolScanner;
use gantry_core::openai::{self, ChatCompletionRequest};
use serde_json::Value;

/// A tool call recovered from model text rather than the wire protocol.
#[derive(Debug, Clone)]
pub struct ExtractedToolCall {
    pub name: String,
    pub arguments: Value,
}

/// One piece of post-processed model output, in document order.
#[derive(Debug, Clone)]
pub enum OutputSegment {
    Text(String),
    ToolCall(ExtractedToolCall),
}

/// Result of post-processing one text delta. Segment order is emission
/// order: text surrounding an extracted tool call stays on its side of it.
#[derive(Debug, Default)]
pub struct ProcessedText {
    pub segments: Vec<OutputSegment>,
    /// True when the adapter changed the delta at all
    pub transformed: bool,
}

impl ProcessedText {
    fn passthrough(delta: &str) -> Self {
        ProcessedText {
            segments: vec![OutputSegment::Text(delta.to_string())],
            transformed: false,
        }
    }

    /// All text content, block excisions applied.
    pub fn text(&self) -> String {
        self.segments
            .iter()
            .filter_map(|s| match s {
                OutputSegment::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    /// All extracted tool calls, in order.
    pub fn tool_calls(&self) -> Vec<&ExtractedToolCall> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                OutputSegment::ToolCall(c) => Some(c),
                _ => None,
            })
            .collect()
    }
}

/// Per-family request/response hooks. One adapter instance lives for the
/// duration of one request; `reset` returns it to its initial state.
pub trait ModelAdapter: Send {
    fn name(&self) -> &'static str;

    /// Whether this adapter handles the given model id.
    fn should_handle(&self, model_id: &str) -> bool;

    /// Customize the outbound payload before it is sent upstream.
    fn prepare_request(&self, _payload: &mut ChatCompletionRequest, _request: &CanonicalRequest) {}

    /// Post-process a text delta from the upstream stream.
    fn process_text_content(&mut self, delta: &str, _accumulated: &str) -> ProcessedText {
        ProcessedText::passthrough(delta)
    }

    /// Text the adapter is still holding at stream end.
    fn flush_text(&mut self) -> String {
        String::new()
    }

    fn reset(&mut self) {}
}

// ============================================================================
// Concrete adapters
// ============================================================================

/// MiniMax: thinking is requested through a bespoke `reasoning_split` flag.
#[derive(Default)]
pub struct MiniMaxAdapter;

impl ModelAdapter for MiniMaxAdapter {
    fn name(&self) -> &'static str {
        "minimax"
    }

    fn should_handle(&self, model_id: &str) -> bool {
        model_id.to_lowercase().contains("minimax")
    }

    fn prepare_request(&self, payload: &mut ChatCompletionRequest, request: &CanonicalRequest) {
        if request.thinking.is_some() {
            payload.extra.insert("reasoning_split".to_string(), Value::Bool(true));
        }
    }
}

/// Grok: nudged toward the native tool_calls wire format, which it otherwise
/// tends to abandon in favor of XML in text.
#[derive(Default)]
pub struct GrokAdapter;

const GROK_TOOL_NOTE: &str = "When calling tools, always use the native tool_calls mechanism. Never describe tool calls as XML or plain text in your reply.";

impl ModelAdapter for GrokAdapter {
    fn name(&self) -> &'static str {
        "grok"
    }

    fn should_handle(&self, model_id: &str) -> bool {
        let id = model_id.to_lowercase();
        id.contains("grok") || id.contains("x-ai")
    }

    fn prepare_request(&self, payload: &mut ChatCompletionRequest, _request: &CanonicalRequest) {
        match payload.messages.iter_mut().find(|m| m.role == openai::Role::System) {
            Some(system) => {
                let existing = match system.content.take() {
                    Some(openai::Content::Text(t)) => t,
                    Some(openai::Content::Parts(parts)) => parts
                        .into_iter()
                        .filter_map(|p| match p {
                            openai::ContentPart::Text { text } => Some(text),
                            _ => None,
                        })
                        .collect::<Vec<_>>()
                        .join("\n\n"),
                    None => String::new(),
                };
                system.content = Some(openai::Content::Text(format!(
                    "{}\n\n{}",
                    GROK_TOOL_NOTE, existing
                )));
            }
            None => payload.messages.insert(
                0,
                openai::Message {
                    role: openai::Role::System,
                    content: Some(openai::Content::Text(GROK_TOOL_NOTE.to_string())),
                    tool_calls: None,
                    tool_call_id: None,
                },
            ),
        }
    }
}

/// Families that embed tool calls as `<function_calls>` XML inside text.
#[derive(Default)]
pub struct XmlToolAdapter {
    scanner: XmlToolScanner,
}

impl ModelAdapter for XmlToolAdapter {
    fn name(&self) -> &'static str {
        "xml_tools"
    }

    fn should_handle(&self, model_id: &str) -> bool {
        let id = model_id.to_lowercase();
        id.contains("qwen") || id.contains("glm")
    }

    fn process_text_content(&mut self, delta: &str, _accumulated: &str) -> ProcessedText {
        let outcome = self.scanner.push(delta);
        let transformed = outcome.matched
            || !matches!(&outcome.segments[..], [OutputSegment::Text(t)] if t == delta);
        ProcessedText { segments: outcome.segments, transformed }
    }

    fn flush_text(&mut self) -> String {
        self.scanner.flush()
    }

    fn reset(&mut self) {
        self.scanner.reset();
    }
}

/// Identity transform; terminal entry of every registry.
#[derive(Default)]
pub struct DefaultAdapter;

impl ModelAdapter for DefaultAdapter {
    fn name(&self) -> &'static str {
        "default"
    }

    fn should_handle(&self, _model_id: &str) -> bool {
        true
    }
}

// ============================================================================
// Registry
// ============================================================================

type AdapterFactory = fn() -> Box<dyn ModelAdapter>;

/// First-match adapter registry, built once at startup.
pub struct AdapterRegistry {
    factories: Vec<AdapterFactory>,
}

impl AdapterRegistry {
    /// The standard registry: MiniMax, Grok, XML-tools, then the default.
    pub fn standard() -> Self {
        Self {
            factories: vec![
                || Box::new(MiniMaxAdapter),
                || Box::new(GrokAdapter),
                || Box::<XmlToolAdapter>::default(),
                || Box::new(DefaultAdapter),
            ],
        }
    }

    /// A fresh adapter instance for this model id. The default adapter
    /// guarantees a match.
    pub fn select(&self, model_id: &str) -> Box<dyn ModelAdapter> {
        for factory in &self.factories {
            let adapter = factory();
            if adapter.should_handle(model_id) {
                return adapter;
            }
        }
        Box::new(DefaultAdapter)
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn empty_canonical(thinking: bool) -> CanonicalRequest {
        CanonicalRequest {
            model: "m".into(),
            system: vec![],
            messages: vec![],
            tools: vec![],
            tool_choice: None,
            max_tokens: 16,
            temperature: None,
            top_p: None,
            stream: true,
            thinking: thinking.then(|| {
                serde_json::from_value(json!({"type": "enabled", "budget_tokens": 1024})).unwrap()
            }),
        }
    }

    fn empty_payload() -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "m".into(),
            messages: vec![],
            max_tokens: Some(16),
            temperature: None,
            top_p: None,
            tools: None,
            tool_choice: None,
            stream: true,
            stream_options: None,
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn registry_first_match_order() {
        let registry = AdapterRegistry::standard();
        assert_eq!(registry.select("MiniMax-M2").name(), "minimax");
        assert_eq!(registry.select("x-ai/grok-4").name(), "grok");
        assert_eq!(registry.select("qwen3-coder").name(), "xml_tools");
        assert_eq!(registry.select("gpt-4o").name(), "default");
    }

    #[test]
    fn minimax_sets_reasoning_split_only_with_thinking() {
        let adapter = MiniMaxAdapter;

        let mut payload = empty_payload();
        adapter.prepare_request(&mut payload, &empty_canonical(true));
        assert_eq!(payload.extra.get("reasoning_split"), Some(&json!(true)));

        let mut payload = empty_payload();
        adapter.prepare_request(&mut payload, &empty_canonical(false));
        assert!(payload.extra.get("reasoning_split").is_none());
    }

    #[test]
    fn grok_prepends_note_to_existing_system() {
        let adapter = GrokAdapter;
        let mut payload = empty_payload();
        payload.messages.push(openai::Message {
            role: openai::Role::System,
            content: Some(openai::Content::Text("be terse".into())),
            tool_calls: None,
            tool_call_id: None,
        });

        adapter.prepare_request(&mut payload, &empty_canonical(false));

        let Some(openai::Content::Text(text)) = &payload.messages[0].content else {
            panic!("expected text content");
        };
        assert!(text.starts_with(GROK_TOOL_NOTE));
        assert!(text.ends_with("be terse"));
    }

    #[test]
    fn grok_inserts_system_when_absent() {
        let adapter = GrokAdapter;
        let mut payload = empty_payload();
        payload.messages.push(openai::Message {
            role: openai::Role::User,
            content: Some(openai::Content::Text("hi".into())),
            tool_calls: None,
            tool_call_id: None,
        });

        adapter.prepare_request(&mut payload, &empty_canonical(false));

        assert_eq!(payload.messages[0].role, openai::Role::System);
        assert_eq!(payload.messages[1].role, openai::Role::User);
    }

    #[test]
    fn default_adapter_passes_text_through() {
        let mut adapter = DefaultAdapter;
        let processed = adapter.process_text_content("hello", "");
        assert_eq!(processed.text(), "hello");
        assert!(processed.tool_calls().is_empty());
        assert!(!processed.transformed);
    }

    #[test]
    fn xml_adapter_extracts_and_reports_transform() {
        let mut adapter = XmlToolAdapter::default();
        let processed = adapter.process_text_content(
            "<function_calls><invoke name=\"bash\"><parameter name=\"command\">ls</parameter></invoke></function_calls>",
            "",
        );
        assert_eq!(processed.tool_calls().len(), 1);
        assert!(processed.transformed);
        assert!(processed.text().is_empty());
    }
}
