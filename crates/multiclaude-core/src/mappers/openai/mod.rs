//! Anthropic ⇄ OpenAI translation for the Copilot backend.

mod request;
pub mod streaming;

#[cfg(test)]
mod tests;

pub use request::{
    has_agent_turns, has_image_parts, transform_claude_to_openai,
};

use multiclaude_types::protocol::claude::{ClaudeResponse, ContentBlock, Usage};
use multiclaude_types::protocol::openai::ChatResponse;
use multiclaude_types::ProxyError;
use serde_json::json;

/// Map an OpenAI finish_reason onto the Anthropic stop_reason vocabulary.
pub fn map_finish_reason(finish_reason: Option<&str>, has_tool_use: bool) -> &'static str {
    match finish_reason {
        Some("length") => "max_tokens",
        Some("tool_calls") => "tool_use",
        _ if has_tool_use => "tool_use",
        _ => "end_turn",
    }
}

/// Convert a non-streaming chat.completions response.
pub fn chat_response_to_claude(
    resp: &ChatResponse,
    requested_model: &str,
) -> Result<ClaudeResponse, ProxyError> {
    let choice = resp.choices.first().ok_or_else(|| ProxyError::Upstream {
        status: 502,
        body: "chat completion had no choices".to_string(),
    })?;

    let mut content: Vec<ContentBlock> = Vec::new();
    if let Some(text) = &choice.message.content {
        if !text.is_empty() {
            content.push(ContentBlock::Text { text: text.clone() });
        }
    }
    if let Some(tool_calls) = &choice.message.tool_calls {
        for call in tool_calls {
            let input = serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));
            content.push(ContentBlock::ToolUse {
                id: call.id.clone(),
                name: call.function.name.clone(),
                input,
                signature: None,
            });
        }
    }

    let has_tool_use = content.iter().any(|b| matches!(b, ContentBlock::ToolUse { .. }));
    let usage = resp
        .usage
        .as_ref()
        .map(|u| Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            cache_read_input_tokens: None,
            cache_creation_input_tokens: None,
        })
        .unwrap_or_default();

    Ok(ClaudeResponse {
        id: resp.id.clone(),
        type_: "message".to_string(),
        role: "assistant".to_string(),
        model: if resp.model.is_empty() { requested_model.to_string() } else { resp.model.clone() },
        content,
        stop_reason: map_finish_reason(choice.finish_reason.as_deref(), has_tool_use).to_string(),
        stop_sequence: None,
        usage,
    })
}
