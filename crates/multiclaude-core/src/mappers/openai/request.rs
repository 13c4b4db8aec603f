//! Anthropic request → OpenAI chat.completions request.

use multiclaude_types::protocol::claude::{
    ClaudeRequest, ContentBlock, MessageContent, SystemPrompt, Tool,
};
use multiclaude_types::protocol::openai::{
    ChatContent, ChatContentPart, ChatMessage, ChatRequest, ChatTool, FunctionCallBody,
    FunctionDef, ImageUrl, ToolCall,
};
use serde_json::Value;

/// Build the chat.completions payload for a Copilot model.
pub fn transform_claude_to_openai(req: &ClaudeRequest, model: &str) -> ChatRequest {
    let mut messages: Vec<ChatMessage> = Vec::new();

    if let Some(system) = system_text(&req.system) {
        messages.push(ChatMessage {
            role: "system".to_string(),
            content: Some(ChatContent::String(system)),
            tool_calls: None,
            tool_call_id: None,
        });
    }

    for msg in &req.messages {
        match &msg.content {
            MessageContent::String(text) => {
                if !text.trim().is_empty() {
                    messages.push(plain_message(&msg.role, text));
                }
            }
            MessageContent::Array(blocks) => {
                append_blocks(&mut messages, &msg.role, blocks);
            }
        }
    }

    ChatRequest {
        model: model.to_string(),
        messages,
        tools: build_tools(&req.tools),
        max_tokens: req.max_tokens,
        temperature: req.temperature,
        top_p: req.top_p,
        stream: req.stream,
    }
}

fn system_text(system: &Option<SystemPrompt>) -> Option<String> {
    match system {
        Some(SystemPrompt::String(s)) if !s.trim().is_empty() => Some(s.clone()),
        Some(SystemPrompt::Array(blocks)) => {
            let joined = blocks
                .iter()
                .filter(|b| !b.text.trim().is_empty())
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            (!joined.is_empty()).then_some(joined)
        }
        _ => None,
    }
}

fn plain_message(role: &str, text: &str) -> ChatMessage {
    ChatMessage {
        role: role.to_string(),
        content: Some(ChatContent::String(text.to_string())),
        tool_calls: None,
        tool_call_id: None,
    }
}

/// Expand one Anthropic message into OpenAI messages. Tool results become
/// dedicated `tool` role messages; assistant tool calls land on the
/// assistant message itself.
fn append_blocks(messages: &mut Vec<ChatMessage>, role: &str, blocks: &[ContentBlock]) {
    let mut parts: Vec<ChatContentPart> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut tool_results: Vec<ChatMessage> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => {
                if !text.trim().is_empty() {
                    parts.push(ChatContentPart::Text { text: text.clone() });
                }
            }
            ContentBlock::Image { source } => {
                let url = match source.source_type.as_str() {
                    "url" => source.url.clone(),
                    _ => source.data.as_ref().map(|data| {
                        format!(
                            "data:{};base64,{}",
                            source.media_type.as_deref().unwrap_or("image/png"),
                            data
                        )
                    }),
                };
                if let Some(url) = url {
                    parts.push(ChatContentPart::ImageUrl { image_url: ImageUrl { url } });
                }
            }
            ContentBlock::ToolUse { id, name, input, .. } => {
                tool_calls.push(ToolCall {
                    id: id.clone(),
                    type_: "function".to_string(),
                    function: FunctionCallBody {
                        name: name.clone(),
                        arguments: serde_json::to_string(input)
                            .unwrap_or_else(|_| "{}".to_string()),
                    },
                });
            }
            ContentBlock::ToolResult { tool_use_id, content, .. } => {
                tool_results.push(ChatMessage {
                    role: "tool".to_string(),
                    content: Some(ChatContent::String(tool_result_text(content))),
                    tool_calls: None,
                    tool_call_id: Some(tool_use_id.clone()),
                });
            }
            // Thinking never crosses into the OpenAI dialect.
            ContentBlock::Thinking { .. } | ContentBlock::RedactedThinking { .. } => {}
            ContentBlock::Document { .. } => {}
        }
    }

    if !parts.is_empty() || !tool_calls.is_empty() {
        let content = match parts.len() {
            0 => None,
            1 => match &parts[0] {
                ChatContentPart::Text { text } => Some(ChatContent::String(text.clone())),
                _ => Some(ChatContent::Parts(parts.clone())),
            },
            _ => Some(ChatContent::Parts(parts.clone())),
        };
        messages.push(ChatMessage {
            role: role.to_string(),
            content,
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            tool_call_id: None,
        });
    }

    messages.extend(tool_results);
}

fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                (item.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .then(|| item.get("text").and_then(|t| t.as_str()))
                    .flatten()
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn build_tools(tools: &Option<Vec<Tool>>) -> Option<Vec<ChatTool>> {
    let tools = tools.as_ref()?;
    let declarations: Vec<ChatTool> = tools
        .iter()
        .filter_map(|t| {
            let name = t.name.clone()?;
            Some(ChatTool {
                type_: "function".to_string(),
                function: FunctionDef {
                    name,
                    description: t.description.clone(),
                    parameters: t.input_schema.clone(),
                },
            })
        })
        .collect();
    (!declarations.is_empty()).then_some(declarations)
}

/// True when any message in the payload carries an image part. Drives the
/// `Copilot-Vision-Request` header.
pub fn has_image_parts(req: &ChatRequest) -> bool {
    req.messages.iter().any(|m| {
        matches!(&m.content, Some(ChatContent::Parts(parts))
            if parts.iter().any(|p| matches!(p, ChatContentPart::ImageUrl { .. })))
    })
}

/// True when any assistant or tool message appears. Drives `X-Initiator`.
pub fn has_agent_turns(req: &ChatRequest) -> bool {
    req.messages.iter().any(|m| m.role == "assistant" || m.role == "tool")
}
