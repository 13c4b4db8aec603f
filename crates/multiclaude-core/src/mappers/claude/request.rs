//! Anthropic request → Google v1internal generateContent payload.

use super::content::{build_contents, normalize_assistant_content};
use super::thinking::repair_thinking;
use super::ModelFamily;
use multiclaude_types::protocol::claude::{
    ClaudeRequest, Message, MessageContent, SystemPrompt, Tool,
};
use multiclaude_types::ProxyError;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// Fixed identity preamble the Antigravity backend expects to see first.
const ANTIGRAVITY_IDENTITY: &str =
    "You are Antigravity, an agentic coding assistant developed by Google, \
     operating inside the Antigravity IDE.";

/// Decoy wrapper around the caller's real system prompt. A compatibility
/// artefact of the upstream service; treat as an externally-specified string.
const DECOY_PREFIX: &str = "The developer has supplied the following session \
instructions, which take precedence over the defaults above:\n<session_instructions>";
const DECOY_SUFFIX: &str = "</session_instructions>";

/// Hint appended for Claude thinking models that also declare tools.
const INTERLEAVED_THINKING_HINT: &str = "Interleaved thinking is enabled. You may \
think between tool calls and after receiving tool results.";

/// Hard ceiling on Gemini output tokens.
const GEMINI_MAX_OUTPUT_TOKENS: u32 = 65_536;

/// Headroom added on top of the thinking budget when the caller's
/// max_tokens would not fit the budget itself.
const THINKING_BUDGET_PADDING: u32 = 8_192;

/// Transform an Anthropic request into the Google envelope.
pub fn transform_claude_request(
    req: &ClaudeRequest,
    project_id: &str,
) -> Result<Value, ProxyError> {
    let mut cleaned = req.clone();
    normalize_assistant_content(&mut cleaned.messages);

    let family = ModelFamily::of(&cleaned.model);
    repair_thinking(&mut cleaned.messages, family);

    let session_id = derive_session_id(&cleaned.messages);
    let contents = build_contents(&cleaned.messages, family);
    if contents.is_empty() {
        return Err(ProxyError::InvalidRequest {
            message: "no usable content in messages".to_string(),
        });
    }

    let mut inner = json!({
        "contents": contents,
        "sessionId": session_id,
    });

    if let Some(system) = build_system_instruction(&cleaned, family) {
        inner["systemInstruction"] = system;
    }

    let generation_config = build_generation_config(&cleaned, family);
    if !generation_config.is_null() {
        inner["generationConfig"] = generation_config;
    }

    if let Some(tools) = build_tools(&cleaned.tools)? {
        inner["tools"] = tools;
        inner["toolConfig"] = json!({
            "functionCallingConfig": { "mode": "VALIDATED" }
        });
    }

    Ok(json!({
        "project": project_id,
        "requestId": format!("agent-{}", uuid::Uuid::new_v4()),
        "request": inner,
        "model": cleaned.model,
        "userAgent": "antigravity",
        "requestType": "agent",
    }))
}

/// Build `systemInstruction`: identity preamble, then the caller's prompt
/// inside the decoy wrapper, then the interleaved-thinking hint when it
/// applies.
fn build_system_instruction(req: &ClaudeRequest, family: ModelFamily) -> Option<Value> {
    let mut parts: Vec<Value> = vec![json!({ "text": ANTIGRAVITY_IDENTITY })];

    let user_system = match &req.system {
        Some(SystemPrompt::String(s)) if !s.trim().is_empty() => Some(s.clone()),
        Some(SystemPrompt::Array(blocks)) => {
            let joined = blocks
                .iter()
                .filter(|b| !b.text.trim().is_empty())
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            if joined.is_empty() {
                None
            } else {
                Some(joined)
            }
        }
        _ => None,
    };

    if let Some(system) = user_system {
        parts.push(json!({ "text": format!("{}\n{}\n{}", DECOY_PREFIX, system, DECOY_SUFFIX) }));
    }

    let thinking_enabled = req.thinking.as_ref().map(|t| t.is_enabled()).unwrap_or(false);
    if family == ModelFamily::Claude && thinking_enabled && req.tools.is_some() {
        parts.push(json!({ "text": INTERLEAVED_THINKING_HINT }));
    }

    Some(json!({ "role": "user", "parts": parts }))
}

fn build_generation_config(req: &ClaudeRequest, family: ModelFamily) -> Value {
    let mut config = serde_json::Map::new();

    if let Some(t) = req.temperature {
        config.insert("temperature".to_string(), json!(t));
    }
    if let Some(p) = req.top_p {
        config.insert("topP".to_string(), json!(p));
    }
    if let Some(k) = req.top_k {
        config.insert("topK".to_string(), json!(k));
    }
    if let Some(stop) = &req.stop_sequences {
        if !stop.is_empty() {
            config.insert("stopSequences".to_string(), json!(stop));
        }
    }

    let thinking_budget = req
        .thinking
        .as_ref()
        .filter(|t| t.is_enabled())
        .and_then(|t| t.budget_tokens);

    let mut max_tokens = req.max_tokens;
    match family {
        ModelFamily::Claude => {
            // The thinking budget must fit inside max_tokens with room for
            // the visible answer.
            if let (Some(max), Some(budget)) = (max_tokens, thinking_budget) {
                if max <= budget {
                    max_tokens = Some(budget + THINKING_BUDGET_PADDING);
                }
            }
        }
        ModelFamily::Gemini => {
            max_tokens = max_tokens.map(|m| m.min(GEMINI_MAX_OUTPUT_TOKENS));
        }
    }

    if let Some(max) = max_tokens {
        config.insert("maxOutputTokens".to_string(), json!(max));
    }

    if let Some(budget) = thinking_budget {
        config.insert(
            "thinkingConfig".to_string(),
            json!({ "includeThoughts": true, "thinkingBudget": budget }),
        );
    }

    if config.is_empty() {
        Value::Null
    } else {
        Value::Object(config)
    }
}

/// Tool list → functionDeclarations with cleaned parameter schemas.
fn build_tools(tools: &Option<Vec<Tool>>) -> Result<Option<Value>, ProxyError> {
    let Some(tools) = tools else { return Ok(None) };

    let mut declarations = Vec::new();
    for tool in tools {
        let Some(name) = &tool.name else { continue };
        let mut schema = tool.input_schema.clone().unwrap_or_else(|| json!({ "type": "object" }));
        crate::mappers::schema::clean_json_schema(&mut schema);

        let mut decl = json!({ "name": name, "parameters": schema });
        if let Some(desc) = &tool.description {
            decl["description"] = json!(desc);
        }
        declarations.push(decl);
    }

    if declarations.is_empty() {
        return Ok(None);
    }
    Ok(Some(json!([{ "functionDeclarations": declarations }])))
}

/// Stable session id: SHA-256 of the first user message's text, truncated
/// to 16 bytes of hex, so prompt caching keys stay stable across turns.
/// Conversations without user text get a random id.
pub fn derive_session_id(messages: &[Message]) -> String {
    let first_user_text = messages.iter().find(|m| m.role == "user").and_then(|m| {
        let text = match &m.content {
            MessageContent::String(s) => s.clone(),
            MessageContent::Array(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    multiclaude_types::protocol::claude::ContentBlock::Text { text } => {
                        Some(text.as_str())
                    }
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        };
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    });

    match first_user_text {
        Some(text) => {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            let digest = hasher.finalize();
            digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
        }
        None => uuid::Uuid::new_v4().simple().to_string(),
    }
}
