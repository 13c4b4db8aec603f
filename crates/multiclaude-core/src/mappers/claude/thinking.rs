//! Thinking-state repair across conversation turns.
//!
//! Clients routinely strip signatures or interrupt tool loops; upstream then
//! rejects the conversation because the last assistant turn carries no signed
//! thinking. Repair is conservative: drop thinking we cannot vouch for and
//! close the loop with synthetic turns rather than rewriting history.

use super::{valid_signature, ModelFamily};
use crate::signature_cache::SignatureCache;
use multiclaude_types::protocol::claude::{ContentBlock, Message, MessageContent};

/// What the conversation tail looks like with respect to tool use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationAnalysis {
    /// Index of the last assistant message.
    pub last_assistant: Option<usize>,
    /// Messages (not blocks) after the last assistant turn that contain at
    /// least one tool_result.
    pub tool_result_count: usize,
    /// Last assistant issued a tool call, no result ever arrived, and a
    /// plain user message follows.
    pub interrupted_tool: bool,
    /// Tool results exist after the last assistant turn.
    pub in_tool_loop: bool,
    /// The last assistant turn carries at least one signed thinking block.
    pub last_assistant_has_signed_thinking: bool,
    /// Some tool_use block in history carries a Gemini-style signature.
    pub history_has_gemini_tool_signatures: bool,
}

pub fn analyze_conversation(messages: &[Message]) -> ConversationAnalysis {
    let last_assistant = messages.iter().rposition(|m| m.role == "assistant");

    let mut tool_result_count = 0;
    if let Some(idx) = last_assistant {
        for msg in &messages[idx + 1..] {
            if message_has_block(msg, |b| matches!(b, ContentBlock::ToolResult { .. })) {
                tool_result_count += 1;
            }
        }
    }

    let last_has_tool_use = last_assistant
        .map(|i| message_has_block(&messages[i], |b| matches!(b, ContentBlock::ToolUse { .. })))
        .unwrap_or(false);
    let user_follows = last_assistant.map(|i| i + 1 < messages.len()).unwrap_or(false);

    let last_assistant_has_signed_thinking = last_assistant
        .map(|i| {
            message_has_block(&messages[i], |b| {
                matches!(b, ContentBlock::Thinking { signature, .. }
                    if valid_signature(signature.as_ref()).is_some())
            })
        })
        .unwrap_or(false);

    let history_has_gemini_tool_signatures = messages.iter().any(|m| {
        message_has_block(m, |b| match b {
            ContentBlock::ToolUse { signature: Some(sig), .. } => {
                match SignatureCache::global().get_signature_family(sig) {
                    Some(family) => ModelFamily::of(&family) == ModelFamily::Gemini,
                    // A signature on a tool_use at all is a Gemini artifact;
                    // Anthropic-native history never carries one.
                    None => valid_signature(Some(sig)).is_some(),
                }
            }
            _ => false,
        })
    });

    ConversationAnalysis {
        last_assistant,
        tool_result_count,
        interrupted_tool: last_has_tool_use && tool_result_count == 0 && user_follows,
        in_tool_loop: tool_result_count > 0,
        last_assistant_has_signed_thinking,
        history_has_gemini_tool_signatures,
    }
}

/// Repair a conversation whose last turn lacks signed thinking while a tool
/// interaction is in flight. Applies to Gemini targets always; to Claude
/// targets only when the history itself carries Gemini-style signatures.
pub fn repair_thinking(messages: &mut Vec<Message>, target: ModelFamily) {
    let analysis = analyze_conversation(messages);

    let recovery_needed = (analysis.in_tool_loop || analysis.interrupted_tool)
        && !analysis.last_assistant_has_signed_thinking;
    if !recovery_needed {
        return;
    }

    let applies = match target {
        ModelFamily::Gemini => true,
        ModelFamily::Claude => analysis.history_has_gemini_tool_signatures,
    };
    if !applies {
        return;
    }

    strip_incompatible_thinking(messages, target);

    if analysis.interrupted_tool {
        let insert_at = analysis.last_assistant.map(|i| i + 1).unwrap_or(messages.len());
        tracing::info!("Thinking repair: closing interrupted tool call with synthetic turn");
        messages.insert(insert_at, Message::text("assistant", "[Tool call was interrupted.]"));
    } else {
        let closure = if analysis.tool_result_count > 1 {
            format!("[{} tool executions completed.]", analysis.tool_result_count)
        } else {
            "[Tool execution completed.]".to_string()
        };
        tracing::info!(
            "Thinking repair: closing tool loop ({} result messages)",
            analysis.tool_result_count
        );
        messages.push(Message::text("assistant", &closure));
        messages.push(Message::text("user", "[Continue]"));
    }
}

/// Remove thinking blocks that are unsigned or signed by the wrong model
/// family.
fn strip_incompatible_thinking(messages: &mut [Message], target: ModelFamily) {
    for msg in messages.iter_mut() {
        if msg.role != "assistant" {
            continue;
        }
        if let MessageContent::Array(blocks) = &mut msg.content {
            blocks.retain(|b| match b {
                ContentBlock::Thinking { signature, .. } => {
                    match valid_signature(signature.as_ref()) {
                        None => false,
                        Some(sig) => SignatureCache::global()
                            .get_signature_family(&sig)
                            .map(|family| target.matches(&family))
                            .unwrap_or(true),
                    }
                }
                _ => true,
            });
        }
    }
}

fn message_has_block(msg: &Message, pred: impl Fn(&ContentBlock) -> bool) -> bool {
    match &msg.content {
        MessageContent::Array(blocks) => blocks.iter().any(pred),
        MessageContent::String(_) => false,
    }
}
