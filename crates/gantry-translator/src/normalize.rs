//! Message normalizer: Anthropic wire request -> canonical request
//!
//! The canonical request is what the rest of the pipeline consumes: system
//! segments flattened, string content coerced to blocks, tool ids deduplicated
//! and parameters the upstream can't use dropped (and recorded, so the
//! dispatcher can advertise them in an advisory header).

use gantry_core::anthropic::{
    Content, ContentBlock, MessagesRequest, Role, SystemPrompt, ThinkingConfig, Tool, ToolChoice,
    ToolResultContent,
};
use gantry_core::GatewayError;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Internal canonical request
#[derive(Debug, Clone)]
pub struct CanonicalRequest {
    pub model: String,
    /// Ordered system text segments
    pub system: Vec<String>,
    pub messages: Vec<Turn>,
    /// Tool definitions with upstream-hostile schema annotations stripped
    pub tools: Vec<ToolSpec>,
    pub tool_choice: Option<ToolChoice>,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub stream: bool,
    pub thinking: Option<ThinkingConfig>,
}

#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct Turn {
    pub role: Role,
    pub blocks: Vec<Block>,
}

/// A canonical content block. Narrower than the wire enum: thinking blocks
/// from conversation history are not carried forward.
#[derive(Debug, Clone)]
pub enum Block {
    Text(String),
    Image {
        media_type: String,
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: ToolResultContent,
        is_error: bool,
    },
}

/// Normalization result: the canonical request plus the names of request
/// parameters that were dropped on the way.
#[derive(Debug)]
pub struct Normalized {
    pub request: CanonicalRequest,
    pub dropped: Vec<String>,
}

/// Normalize a wire request into canonical form.
///
/// Fails with `InvalidRequest` naming the offending field path.
pub fn normalize(wire: MessagesRequest) -> Result<Normalized, GatewayError> {
    if wire.messages.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "messages: must contain at least one message".to_string(),
        ));
    }

    let mut dropped = Vec::new();
    if wire.top_k.is_some() {
        dropped.push("top_k".to_string());
    }
    if wire.stop_sequences.is_some() {
        dropped.push("stop_sequences".to_string());
    }
    if let Some(extra) = &wire.extra {
        for key in extra.keys() {
            dropped.push(key.clone());
        }
    }

    let system = wire.system.as_ref().map(normalize_system).unwrap_or_default();

    let mut messages = Vec::with_capacity(wire.messages.len());
    let mut known_tool_use_ids: HashSet<String> = HashSet::new();

    for (msg_index, msg) in wire.messages.into_iter().enumerate() {
        let turn = normalize_turn(msg_index, msg.role, msg.content, &mut known_tool_use_ids)?;
        messages.push(turn);
    }

    let tools = wire
        .tools
        .unwrap_or_default()
        .into_iter()
        .map(normalize_tool)
        .collect();

    Ok(Normalized {
        request: CanonicalRequest {
            model: wire.model,
            system,
            messages,
            tools,
            tool_choice: wire.tool_choice,
            max_tokens: wire.max_tokens,
            temperature: wire.temperature,
            top_p: wire.top_p,
            stream: wire.stream.unwrap_or(false),
            thinking: wire.thinking,
        },
        dropped,
    })
}

fn normalize_system(prompt: &SystemPrompt) -> Vec<String> {
    prompt.segments().into_iter().filter(|s| !s.is_empty()).collect()
}

fn normalize_turn(
    msg_index: usize,
    role: Role,
    content: Content,
    known_tool_use_ids: &mut HashSet<String>,
) -> Result<Turn, GatewayError> {
    let wire_blocks = content.into_blocks();
    let mut blocks = Vec::with_capacity(wire_blocks.len());

    // Dedup scopes are per-turn: first occurrence wins
    let mut turn_tool_use_ids: HashSet<String> = HashSet::new();
    let mut turn_tool_result_ids: HashSet<String> = HashSet::new();

    for (block_index, block) in wire_blocks.into_iter().enumerate() {
        let path = || format!("messages[{}].content[{}]", msg_index, block_index);

        match block {
            ContentBlock::Text { text } => blocks.push(Block::Text(text)),
            ContentBlock::Thinking { .. } => {
                // Model-internal reasoning from history is not replayed upstream
                debug!("dropping thinking block at {}", path());
            }
            ContentBlock::Image { source } => {
                if role != Role::User {
                    return Err(GatewayError::InvalidRequest(format!(
                        "{}: image blocks are only valid in user turns",
                        path()
                    )));
                }
                blocks.push(Block::Image {
                    media_type: source.media_type,
                    data: source.data,
                });
            }
            ContentBlock::ToolUse { id, name, input } => {
                if role != Role::Assistant {
                    return Err(GatewayError::InvalidRequest(format!(
                        "{}: tool_use blocks are only valid in assistant turns",
                        path()
                    )));
                }
                if !turn_tool_use_ids.insert(id.clone()) {
                    warn!("duplicate tool_use id {} at {}, discarding", id, path());
                    continue;
                }
                known_tool_use_ids.insert(id.clone());
                blocks.push(Block::ToolUse { id, name, input });
            }
            ContentBlock::ToolResult { tool_use_id, content, is_error } => {
                if role != Role::User {
                    return Err(GatewayError::InvalidRequest(format!(
                        "{}: tool_result blocks are only valid in user turns",
                        path()
                    )));
                }
                if !known_tool_use_ids.contains(&tool_use_id) {
                    warn!(
                        "tool_result {} at {} has no matching tool_use, discarding",
                        tool_use_id,
                        path()
                    );
                    continue;
                }
                if !turn_tool_result_ids.insert(tool_use_id.clone()) {
                    warn!(
                        "duplicate tool_result for {} at {}, discarding",
                        tool_use_id,
                        path()
                    );
                    continue;
                }
                blocks.push(Block::ToolResult {
                    tool_use_id,
                    content,
                    is_error: is_error.unwrap_or(false),
                });
            }
        }
    }

    Ok(Turn { role, blocks })
}

fn normalize_tool(tool: Tool) -> ToolSpec {
    let mut schema = tool.input_schema;
    strip_uri_format(&mut schema);
    ToolSpec {
        name: tool.name,
        description: tool.description,
        input_schema: schema,
    }
}

/// Recursively remove `"format": "uri"` annotations from a JSON schema tree.
/// Several OpenAI-compatible upstreams reject the annotation outright.
pub fn strip_uri_format(schema: &mut serde_json::Value) {
    match schema {
        serde_json::Value::Object(obj) => {
            if obj.get("format").and_then(|v| v.as_str()) == Some("uri") {
                obj.remove("format");
            }
            for (_k, v) in obj.iter_mut() {
                strip_uri_format(v);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                strip_uri_format(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wire(v: serde_json::Value) -> MessagesRequest {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn string_content_coerces_to_text_block() {
        let result = normalize(wire(json!({
            "model": "m",
            "max_tokens": 10,
            "messages": [{"role": "user", "content": "hi"}]
        })))
        .unwrap();

        assert!(matches!(result.request.messages[0].blocks[0], Block::Text(ref t) if t == "hi"));
        assert!(result.dropped.is_empty());
    }

    #[test]
    fn empty_messages_rejected() {
        let err = normalize(wire(json!({
            "model": "m",
            "max_tokens": 10,
            "messages": []
        })))
        .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
    }

    #[test]
    fn top_k_is_dropped_and_recorded() {
        let result = normalize(wire(json!({
            "model": "m",
            "max_tokens": 10,
            "top_k": 40,
            "messages": [{"role": "user", "content": "hi"}]
        })))
        .unwrap();
        assert_eq!(result.dropped, vec!["top_k"]);
    }

    #[test]
    fn duplicate_tool_use_ids_first_wins() {
        let result = normalize(wire(json!({
            "model": "m",
            "max_tokens": 10,
            "messages": [{
                "role": "assistant",
                "content": [
                    {"type": "tool_use", "id": "t1", "name": "first", "input": {}},
                    {"type": "tool_use", "id": "t1", "name": "second", "input": {}}
                ]
            }]
        })))
        .unwrap();

        let blocks = &result.request.messages[0].blocks;
        assert_eq!(blocks.len(), 1);
        assert!(matches!(&blocks[0], Block::ToolUse { name, .. } if name == "first"));
    }

    #[test]
    fn orphaned_tool_result_discarded() {
        let result = normalize(wire(json!({
            "model": "m",
            "max_tokens": 10,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "tool_result", "tool_use_id": "never-issued", "content": "x"},
                    {"type": "text", "text": "hello"}
                ]
            }]
        })))
        .unwrap();

        let blocks = &result.request.messages[0].blocks;
        assert_eq!(blocks.len(), 1);
        assert!(matches!(blocks[0], Block::Text(_)));
    }

    #[test]
    fn duplicate_tool_results_in_one_turn_first_wins() {
        let result = normalize(wire(json!({
            "model": "m",
            "max_tokens": 10,
            "messages": [
                {
                    "role": "assistant",
                    "content": [{"type": "tool_use", "id": "t1", "name": "calc", "input": {}}]
                },
                {
                    "role": "user",
                    "content": [
                        {"type": "tool_result", "tool_use_id": "t1", "content": "3"},
                        {"type": "tool_result", "tool_use_id": "t1", "content": "4"}
                    ]
                }
            ]
        })))
        .unwrap();

        let blocks = &result.request.messages[1].blocks;
        assert_eq!(blocks.len(), 1);
        let Block::ToolResult { content, .. } = &blocks[0] else {
            panic!("expected tool_result");
        };
        assert_eq!(content.to_plaintext(), "3");
    }

    #[test]
    fn tool_use_in_user_turn_rejected_with_path() {
        let err = normalize(wire(json!({
            "model": "m",
            "max_tokens": 10,
            "messages": [{
                "role": "user",
                "content": [{"type": "tool_use", "id": "t1", "name": "calc", "input": {}}]
            }]
        })))
        .unwrap_err();

        let GatewayError::InvalidRequest(msg) = err else {
            panic!("expected invalid_request");
        };
        assert!(msg.contains("messages[0].content[0]"));
    }

    #[test]
    fn strip_uri_format_is_recursive() {
        let mut schema = json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "format": "uri"},
                "nested": {
                    "type": "array",
                    "items": {"type": "string", "format": "uri"}
                },
                "date": {"type": "string", "format": "date-time"}
            }
        });
        strip_uri_format(&mut schema);

        assert!(schema["properties"]["url"].get("format").is_none());
        assert!(schema["properties"]["nested"]["items"].get("format").is_none());
        // Other formats survive
        assert_eq!(schema["properties"]["date"]["format"], "date-time");
    }

    #[test]
    fn thinking_blocks_from_history_are_dropped() {
        let result = normalize(wire(json!({
            "model": "m",
            "max_tokens": 10,
            "messages": [{
                "role": "assistant",
                "content": [
                    {"type": "thinking", "thinking": "hmm"},
                    {"type": "text", "text": "answer"}
                ]
            }]
        })))
        .unwrap();

        let blocks = &result.request.messages[0].blocks;
        assert_eq!(blocks.len(), 1);
        assert!(matches!(blocks[0], Block::Text(_)));
    }
}
