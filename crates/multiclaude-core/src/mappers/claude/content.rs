//! Content-block conversion: Anthropic messages to Google contents.

use super::{valid_signature, ModelFamily, SKIP_SIGNATURE_PLACEHOLDER};
use crate::signature_cache::SignatureCache;
use multiclaude_types::protocol::claude::{ContentBlock, MediaSource, Message, MessageContent};
use multiclaude_types::protocol::gemini::{
    FileData, FunctionCall, FunctionResponse, GeminiContent, GeminiPart, InlineData,
};
use serde_json::{json, Value};

fn is_blank(text: &str) -> bool {
    text.trim().is_empty()
}

/// Reorder one assistant turn's blocks into the shape upstream expects:
/// thinking first, then text and media, then tool calls. Whitespace-only
/// text and unsigned thinking are dropped; undersized signatures count as
/// unsigned. Idempotent.
pub fn reorder_assistant_blocks(blocks: &mut Vec<ContentBlock>) {
    let mut thinking = Vec::new();
    let mut middle = Vec::new();
    let mut tools = Vec::new();

    for block in blocks.drain(..) {
        match block {
            ContentBlock::Thinking { thinking: text, signature } => {
                if let Some(sig) = valid_signature(signature.as_ref()) {
                    thinking.push(ContentBlock::Thinking { thinking: text, signature: Some(sig) });
                }
            }
            ContentBlock::RedactedThinking { .. } => thinking.push(block),
            ContentBlock::Text { ref text } if is_blank(text) => {}
            ContentBlock::ToolUse { .. } => tools.push(block),
            other => middle.push(other),
        }
    }

    blocks.extend(thinking);
    blocks.extend(middle);
    blocks.extend(tools);
}

/// Apply [`reorder_assistant_blocks`] to every assistant turn with array
/// content, regardless of the target model.
pub fn normalize_assistant_content(messages: &mut [Message]) {
    for msg in messages.iter_mut() {
        if msg.role == "assistant" {
            if let MessageContent::Array(blocks) = &mut msg.content {
                reorder_assistant_blocks(blocks);
            }
        }
    }
}

/// Build the full Google `contents` array, merging adjacent same-role
/// entries. Messages whose parts all drop out are skipped.
pub fn build_contents(messages: &[Message], family: ModelFamily) -> Vec<GeminiContent> {
    let mut contents: Vec<GeminiContent> = Vec::new();

    for msg in messages {
        let role = if msg.role == "assistant" { "model" } else { "user" };
        let parts = message_parts(msg, family);
        if parts.is_empty() {
            continue;
        }
        match contents.last_mut() {
            Some(last) if last.role == role => last.parts.extend(parts),
            _ => contents.push(GeminiContent { role: role.to_string(), parts }),
        }
    }

    contents
}

fn message_parts(msg: &Message, family: ModelFamily) -> Vec<GeminiPart> {
    match &msg.content {
        MessageContent::String(text) => {
            if is_blank(text) {
                vec![]
            } else {
                vec![GeminiPart { text: Some(text.clone()), ..Default::default() }]
            }
        }
        MessageContent::Array(blocks) => {
            let mut parts = Vec::new();
            for block in blocks {
                parts.extend(block_to_parts(block, family));
            }
            parts
        }
    }
}

fn block_to_parts(block: &ContentBlock, family: ModelFamily) -> Vec<GeminiPart> {
    match block {
        ContentBlock::Text { text } => {
            if is_blank(text) {
                vec![]
            } else {
                vec![GeminiPart { text: Some(text.clone()), ..Default::default() }]
            }
        }

        ContentBlock::Thinking { thinking, signature } => match valid_signature(signature.as_ref())
        {
            Some(sig) => vec![GeminiPart {
                text: Some(thinking.clone()),
                thought: Some(true),
                thought_signature: Some(sig),
                ..Default::default()
            }],
            None => vec![],
        },

        ContentBlock::RedactedThinking { data } => vec![GeminiPart {
            text: Some(String::new()),
            thought: Some(true),
            thought_signature: Some(data.clone()),
            ..Default::default()
        }],

        ContentBlock::Image { source } => media_part(source, "image/png"),

        ContentBlock::Document { source } => media_part(source, "application/pdf"),

        ContentBlock::ToolUse { id, name, input, signature } => {
            let part_signature = match family {
                ModelFamily::Gemini => Some(
                    valid_signature(signature.as_ref())
                        .or_else(|| SignatureCache::global().get_tool_signature(id))
                        .unwrap_or_else(|| SKIP_SIGNATURE_PLACEHOLDER.to_string()),
                ),
                ModelFamily::Claude => valid_signature(signature.as_ref()),
            };
            // Claude models resolve calls by id; Gemini matches on name.
            let call_id =
                if family == ModelFamily::Claude { Some(id.clone()) } else { None };
            vec![GeminiPart {
                function_call: Some(FunctionCall {
                    name: name.clone(),
                    id: call_id,
                    args: Some(if input.is_null() { json!({}) } else { input.clone() }),
                }),
                thought_signature: part_signature,
                ..Default::default()
            }]
        }

        ContentBlock::ToolResult { tool_use_id, content, .. } => {
            let (result_text, images) = flatten_tool_result(content);
            let mut parts = vec![GeminiPart {
                function_response: Some(FunctionResponse {
                    name: tool_use_id.clone(),
                    response: json!({ "result": result_text }),
                    id: None,
                }),
                ..Default::default()
            }];
            // Images inside the result become sibling parts so the model
            // can actually see them.
            for (mime, data) in images {
                parts.push(GeminiPart {
                    inline_data: Some(InlineData { mime_type: mime, data }),
                    ..Default::default()
                });
            }
            parts
        }
    }
}

fn media_part(source: &MediaSource, default_mime: &str) -> Vec<GeminiPart> {
    let mime = source.media_type.clone().unwrap_or_else(|| default_mime.to_string());
    if source.source_type == "url" {
        if let Some(url) = &source.url {
            return vec![GeminiPart {
                file_data: Some(FileData { mime_type: mime, file_uri: url.clone() }),
                ..Default::default()
            }];
        }
        return vec![];
    }
    match &source.data {
        Some(data) => vec![GeminiPart {
            inline_data: Some(InlineData { mime_type: mime, data: data.clone() }),
            ..Default::default()
        }],
        None => vec![],
    }
}

/// Join nested text blocks of a tool result and lift out base64 images.
/// Results that contain only images report `"Image attached"`.
fn flatten_tool_result(content: &Value) -> (String, Vec<(String, String)>) {
    let mut texts: Vec<String> = Vec::new();
    let mut images: Vec<(String, String)> = Vec::new();

    match content {
        Value::String(s) => texts.push(s.clone()),
        Value::Array(items) => {
            for item in items {
                match item.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        if let Some(t) = item.get("text").and_then(|t| t.as_str()) {
                            texts.push(t.to_string());
                        }
                    }
                    Some("image") => {
                        let mime = item
                            .pointer("/source/media_type")
                            .and_then(|m| m.as_str())
                            .unwrap_or("image/png")
                            .to_string();
                        if let Some(data) =
                            item.pointer("/source/data").and_then(|d| d.as_str())
                        {
                            images.push((mime, data.to_string()));
                        }
                    }
                    _ => {}
                }
            }
        }
        Value::Null => {}
        other => texts.push(other.to_string()),
    }

    let text = if texts.is_empty() && !images.is_empty() {
        "Image attached".to_string()
    } else {
        texts.join("\n")
    };
    (text, images)
}
