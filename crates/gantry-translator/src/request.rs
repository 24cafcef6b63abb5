//! OpenAI request builder: canonical request -> chat-completions payload

use crate::identity;
use crate::normalize::{Block, CanonicalRequest, Turn};
use gantry_core::anthropic::{Role as AnthropicRole, ToolChoice};
use gantry_core::openai;
use tracing::warn;

/// Build the upstream chat-completions payload from a canonical request.
///
/// The payload still goes through the selected adapter's `prepare_request`
/// before it is sent.
pub fn build_chat_request(req: &CanonicalRequest) -> openai::ChatCompletionRequest {
    let mut messages = Vec::with_capacity(req.messages.len() + 1);

    if let Some(system) = system_message(&req.system) {
        messages.push(system);
    }
    for turn in &req.messages {
        messages.extend(turn_to_messages(turn));
    }

    let tools = if req.tools.is_empty() {
        None
    } else {
        Some(
            req.tools
                .iter()
                .map(|t| openai::Tool {
                    tool_type: "function".to_string(),
                    function: openai::FunctionDef {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.input_schema.clone(),
                    },
                })
                .collect(),
        )
    };

    openai::ChatCompletionRequest {
        model: req.model.clone(),
        messages,
        max_tokens: Some(req.max_tokens),
        temperature: req.temperature,
        top_p: req.top_p,
        tools,
        tool_choice: req.tool_choice.as_ref().map(map_tool_choice),
        stream: req.stream,
        stream_options: req
            .stream
            .then_some(openai::StreamOptions { include_usage: true }),
        extra: serde_json::Map::new(),
    }
}

/// Join system segments and run the identity filter when the prompt belongs
/// to a Claude-family CLI client.
fn system_message(segments: &[String]) -> Option<openai::Message> {
    if segments.is_empty() {
        return None;
    }
    let joined = segments.join("\n\n");
    let text = if identity::applies_to(&joined) {
        identity::apply(&joined)
    } else {
        joined
    };
    Some(openai::Message {
        role: openai::Role::System,
        content: Some(openai::Content::Text(text)),
        tool_calls: None,
        tool_call_id: None,
    })
}

/// Convert one canonical turn to one or more OpenAI messages.
///
/// User turns with tool_results fan out: the `role:"tool"` messages come
/// first, then whatever user content remains. Assistant turns fold their
/// tool_use blocks into a `tool_calls` array with JSON-string arguments.
fn turn_to_messages(turn: &Turn) -> Vec<openai::Message> {
    let mut out = Vec::new();
    let mut parts: Vec<openai::ContentPart> = Vec::new();
    let mut tool_calls: Vec<openai::ToolCall> = Vec::new();
    let mut has_image = false;

    for block in &turn.blocks {
        match block {
            Block::Text(text) => parts.push(openai::ContentPart::Text { text: text.clone() }),
            Block::Image { media_type, data } => {
                has_image = true;
                parts.push(openai::ContentPart::ImageUrl {
                    image_url: openai::ImageUrl {
                        url: format!("data:{};base64,{}", media_type, data),
                    },
                });
            }
            Block::ToolUse { id, name, input } => {
                let arguments = serde_json::to_string(input).unwrap_or_else(|e| {
                    warn!("failed to serialize tool_use input for {}: {}", id, e);
                    "{}".to_string()
                });
                tool_calls.push(openai::ToolCall {
                    id: id.clone(),
                    call_type: "function".to_string(),
                    function: openai::FunctionCall { name: name.clone(), arguments },
                });
            }
            Block::ToolResult { tool_use_id, content, .. } => {
                out.push(openai::Message {
                    role: openai::Role::Tool,
                    content: Some(openai::Content::Text(content.to_plaintext())),
                    tool_calls: None,
                    tool_call_id: Some(tool_use_id.clone()),
                });
            }
        }
    }

    let role = match turn.role {
        AnthropicRole::User => openai::Role::User,
        AnthropicRole::Assistant => openai::Role::Assistant,
    };

    // Multimodal content keeps its part structure; pure text flattens
    let content = if has_image {
        Some(openai::Content::Parts(parts))
    } else {
        let text = parts
            .iter()
            .filter_map(|p| match p {
                openai::ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        (!text.is_empty()).then_some(openai::Content::Text(text))
    };

    if content.is_some() || !tool_calls.is_empty() {
        out.push(openai::Message {
            role,
            content,
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            tool_call_id: None,
        });
    }

    out
}

fn map_tool_choice(choice: &ToolChoice) -> openai::ToolChoice {
    match choice {
        ToolChoice::Auto => openai::ToolChoice::Mode("auto".to_string()),
        ToolChoice::None => openai::ToolChoice::Mode("none".to_string()),
        ToolChoice::Tool { name } => openai::ToolChoice::Function {
            choice_type: "function".to_string(),
            function: openai::FunctionName { name: name.clone() },
        },
    }
}
