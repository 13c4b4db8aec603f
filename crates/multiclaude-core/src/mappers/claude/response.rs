//! Google generateContent response → Anthropic message.

use super::valid_signature;
use crate::signature_cache::SignatureCache;
use multiclaude_types::protocol::claude::{ClaudeResponse, ContentBlock, Usage};
use multiclaude_types::protocol::gemini::GeminiResponse;
use multiclaude_types::ProxyError;
use serde_json::json;

/// Convert a complete upstream response into an Anthropic message.
pub fn transform_response(
    gemini: &GeminiResponse,
    requested_model: &str,
) -> Result<ClaudeResponse, ProxyError> {
    let mut content: Vec<ContentBlock> = Vec::new();
    let mut finish_reason: Option<String> = None;

    if let Some(candidate) = gemini.candidates.as_ref().and_then(|c| c.first()) {
        finish_reason = candidate.finish_reason.clone();
        if let Some(parts) = candidate.content.as_ref().map(|c| &c.parts) {
            for part in parts {
                let signature = valid_signature(part.thought_signature.as_ref());

                if let Some(fc) = &part.function_call {
                    let id = fc
                        .id
                        .clone()
                        .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple()));
                    if let Some(sig) = &signature {
                        SignatureCache::global().cache_tool_signature(&id, sig.clone());
                        SignatureCache::global()
                            .cache_thinking_family(sig.clone(), requested_model.to_string());
                    }
                    content.push(ContentBlock::ToolUse {
                        id,
                        name: fc.name.clone(),
                        input: fc.args.clone().unwrap_or_else(|| json!({})),
                        signature,
                    });
                    continue;
                }

                if let Some(text) = &part.text {
                    if part.thought.unwrap_or(false) {
                        if let Some(sig) = &signature {
                            SignatureCache::global()
                                .cache_thinking_family(sig.clone(), requested_model.to_string());
                        }
                        content.push(ContentBlock::Thinking {
                            thinking: text.clone(),
                            signature,
                        });
                    } else if !text.trim().is_empty() {
                        content.push(ContentBlock::Text { text: text.clone() });
                    }
                }
            }
        }
    }

    let has_tool_use = content.iter().any(|b| matches!(b, ContentBlock::ToolUse { .. }));
    let stop_reason = resolve_stop_reason(finish_reason.as_deref(), has_tool_use);

    let usage = gemini
        .usage_metadata
        .as_ref()
        .map(|u| {
            let prompt = u.prompt_token_count.unwrap_or(0);
            let cached = u.cached_content_token_count.unwrap_or(0);
            Usage {
                input_tokens: prompt.saturating_sub(cached),
                output_tokens: u.candidates_token_count.unwrap_or(0),
                cache_read_input_tokens: Some(cached),
                cache_creation_input_tokens: Some(0),
            }
        })
        .unwrap_or_default();

    Ok(ClaudeResponse {
        id: gemini
            .response_id
            .clone()
            .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple())),
        type_: "message".to_string(),
        role: "assistant".to_string(),
        model: gemini.model_version.clone().unwrap_or_else(|| requested_model.to_string()),
        content,
        stop_reason: stop_reason.to_string(),
        stop_sequence: None,
        usage,
    })
}

/// stop_reason precedence: MAX_TOKENS wins outright; any tool call maps to
/// tool_use even when upstream says STOP; everything else is end_turn.
pub fn resolve_stop_reason(finish_reason: Option<&str>, has_tool_use: bool) -> &'static str {
    match finish_reason {
        Some("MAX_TOKENS") => "max_tokens",
        Some("TOOL_USE") => "tool_use",
        _ if has_tool_use => "tool_use",
        _ => "end_turn",
    }
}
