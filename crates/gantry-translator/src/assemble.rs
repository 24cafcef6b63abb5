//! Non-streaming assembler
//!
//! When the client asked for a JSON response, the dispatcher still streams
//! from the upstream and runs the stream translator; this module folds the
//! translated event sequence into a single `MessagesResponse`.

use gantry_core::anthropic::{
    ContentBlock, ContentBlockStart, ContentDelta, MessagesResponse, Role, StopReason, StreamEvent,
    Usage,
};
use tracing::warn;

#[derive(Debug)]
enum PendingBlock {
    Text { text: String },
    Thinking { thinking: String },
    ToolUse { id: String, name: String, args: String },
}

/// Fold a translated event sequence into one response body.
///
/// `input_tokens` comes from the translator's final upstream usage; the
/// placeholder on `message_start` is not trusted.
pub fn assemble(events: &[StreamEvent], input_tokens: u32) -> MessagesResponse {
    let mut id = String::new();
    let mut model = String::new();
    let mut blocks: Vec<(usize, PendingBlock)> = Vec::new();
    let mut stop_reason: Option<StopReason> = None;
    let mut output_tokens = 0;

    for event in events {
        match event {
            StreamEvent::MessageStart { message } => {
                id = message.id.clone();
                model = message.model.clone();
            }
            StreamEvent::ContentBlockStart { index, content_block } => {
                let pending = match content_block {
                    ContentBlockStart::Text { text } => PendingBlock::Text { text: text.clone() },
                    ContentBlockStart::Thinking { thinking } => {
                        PendingBlock::Thinking { thinking: thinking.clone() }
                    }
                    ContentBlockStart::ToolUse { id, name, .. } => PendingBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        args: String::new(),
                    },
                };
                blocks.push((*index, pending));
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                let Some((_, pending)) = blocks.iter_mut().find(|(i, _)| i == index) else {
                    warn!("delta for unknown block index {}", index);
                    continue;
                };
                match (pending, delta) {
                    (PendingBlock::Text { text }, ContentDelta::TextDelta { text: t }) => {
                        text.push_str(t)
                    }
                    (
                        PendingBlock::Thinking { thinking },
                        ContentDelta::ThinkingDelta { thinking: t },
                    ) => thinking.push_str(t),
                    (
                        PendingBlock::ToolUse { args, .. },
                        ContentDelta::InputJsonDelta { partial_json },
                    ) => args.push_str(partial_json),
                    (pending, delta) => {
                        warn!("delta kind mismatch on block {}: {:?} <- {:?}", index, pending, delta)
                    }
                }
            }
            StreamEvent::MessageDelta { delta, usage } => {
                stop_reason = delta.stop_reason;
                output_tokens = usage.output_tokens;
            }
            StreamEvent::ContentBlockStop { .. }
            | StreamEvent::MessageStop
            | StreamEvent::Ping
            | StreamEvent::Error { .. } => {}
        }
    }

    let content = blocks
        .into_iter()
        .map(|(_, pending)| match pending {
            PendingBlock::Text { text } => ContentBlock::Text { text },
            PendingBlock::Thinking { thinking } => {
                ContentBlock::Thinking { thinking, signature: String::new() }
            }
            PendingBlock::ToolUse { id, name, args } => {
                let input = if args.is_empty() {
                    serde_json::json!({})
                } else {
                    serde_json::from_str(&args).unwrap_or_else(|e| {
                        warn!("tool {} arguments did not parse as JSON ({}), using {{}}", id, e);
                        serde_json::json!({})
                    })
                };
                ContentBlock::ToolUse { id, name, input }
            }
        })
        .collect();

    MessagesResponse {
        id,
        response_type: "message".to_string(),
        role: Role::Assistant,
        content,
        model,
        stop_reason,
        stop_sequence: None,
        usage: Usage { input_tokens, output_tokens },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::DefaultAdapter;
    use crate::stream::StreamTranslator;
    use serde_json::json;

    fn run(chunks: &[serde_json::Value]) -> (Vec<StreamEvent>, u32) {
        let mut t = StreamTranslator::new("test-model", Box::new(DefaultAdapter));
        let mut events = t.start();
        for c in chunks {
            events.extend(t.on_payload(&c.to_string()));
        }
        events.extend(t.finish());
        let prompt = t.prompt_tokens();
        (events, prompt)
    }

    #[test]
    fn assembles_text_reply() {
        let (events, prompt) = run(&[
            json!({"choices": [{"delta": {"content": "Hel"}}]}),
            json!({"choices": [{"delta": {"content": "lo"}}]}),
            json!({"choices": [{"delta": {}, "finish_reason": "stop"}],
                   "usage": {"prompt_tokens": 5, "completion_tokens": 2}}),
        ]);

        let response = assemble(&events, prompt);
        assert_eq!(response.content.len(), 1);
        assert!(matches!(&response.content[0], ContentBlock::Text { text } if text == "Hello"));
        assert_eq!(response.stop_reason, Some(StopReason::EndTurn));
        assert_eq!(response.usage.input_tokens, 5);
        assert_eq!(response.usage.output_tokens, 2);
        assert!(response.stop_sequence.is_none());
        assert!(response.id.starts_with("msg_"));
    }

    #[test]
    fn coalesces_split_tool_arguments() {
        let (events, prompt) = run(&[
            json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_42", "function": {"name": "get_weather", "arguments": "{\"loc"}}
            ]}}]}),
            json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "ation\":\"Paris\"}"}}
            ]}}]}),
            json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]}),
        ]);

        let response = assemble(&events, prompt);
        let ContentBlock::ToolUse { id, name, input } = &response.content[0] else {
            panic!("expected tool_use");
        };
        assert_eq!(id, "call_42");
        assert_eq!(name, "get_weather");
        assert_eq!(*input, json!({"location": "Paris"}));
        assert_eq!(response.stop_reason, Some(StopReason::ToolUse));
    }

    #[test]
    fn malformed_tool_arguments_become_empty_object() {
        let (events, prompt) = run(&[
            json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "c1", "function": {"name": "calc", "arguments": "{\"broken"}}
            ]}}]}),
            json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]}),
        ]);

        let response = assemble(&events, prompt);
        let ContentBlock::ToolUse { input, .. } = &response.content[0] else {
            panic!("expected tool_use");
        };
        assert_eq!(*input, json!({}));
    }

    #[test]
    fn preserves_block_order_for_mixed_content() {
        let (events, prompt) = run(&[
            json!({"choices": [{"delta": {"content": "Looking up… "}}]}),
            json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "c1", "function": {"name": "lookup", "arguments": "{}"}}
            ]}}]}),
            json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]}),
        ]);

        let response = assemble(&events, prompt);
        assert_eq!(response.content.len(), 2);
        assert!(matches!(response.content[0], ContentBlock::Text { .. }));
        assert!(matches!(response.content[1], ContentBlock::ToolUse { .. }));
    }
}
