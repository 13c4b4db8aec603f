//! Gemini SSE stream → Anthropic streaming events.
//!
//! The state machine tracks one open content block at a time. Block
//! transitions close the previous block (flushing any pending thinking
//! signature first), whitespace text never opens a block, and function
//! calls arrive as one atomic start/delta/stop triple. `message_start` is
//! emitted exactly once, on the first chunk that carries parts; a stream
//! that ends without one is reported as empty so the dispatch can retry.

use super::valid_signature;
use crate::signature_cache::SignatureCache;
use bytes::Bytes;
use multiclaude_types::protocol::gemini::{GeminiPart, GeminiResponse, UsageMetadata};
use serde_json::{json, Value};

/// Text of the canned completion sent when every empty-response retry fails.
pub const EMPTY_RESPONSE_FALLBACK_TEXT: &str = "[No response after retries - please try again]";

/// Event buffer sized for the occasional very large model output.
pub const SSE_BUFFER_CAPACITY: usize = 1024 * 1024;

/// Types of content blocks in a streaming response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    None,
    Text,
    Thinking,
    ToolUse,
}

/// State machine converting Gemini stream chunks to Anthropic events.
pub struct StreamingState {
    block_type: BlockType,
    block_index: usize,
    message_start_sent: bool,
    pending_signature: Option<String>,
    used_tool: bool,
    saw_max_tokens: bool,
    model: String,
    last_usage: Option<UsageMetadata>,
}

impl StreamingState {
    pub fn new(model: &str) -> Self {
        Self {
            block_type: BlockType::None,
            block_index: 0,
            message_start_sent: false,
            pending_signature: None,
            used_tool: false,
            saw_max_tokens: false,
            model: model.to_string(),
            last_usage: None,
        }
    }

    pub fn has_emitted(&self) -> bool {
        self.message_start_sent
    }

    fn emit(&self, event_type: &str, data: Value) -> Bytes {
        let sse = format!(
            "event: {}\ndata: {}\n\n",
            event_type,
            serde_json::to_string(&data).unwrap_or_default()
        );
        Bytes::from(sse)
    }

    fn emit_delta(&self, delta: Value) -> Bytes {
        self.emit(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": self.block_index,
                "delta": delta
            }),
        )
    }

    /// Process one decoded SSE payload, producing zero or more events.
    pub fn process_chunk(&mut self, raw: &Value) -> Vec<Bytes> {
        // v1internal wraps the generateContent body in a `response` field.
        let payload = raw.get("response").unwrap_or(raw);
        let resp: GeminiResponse = match serde_json::from_value(payload.clone()) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!("Ignoring unparsable stream chunk: {}", e);
                return vec![];
            }
        };

        if resp.usage_metadata.is_some() {
            self.last_usage = resp.usage_metadata.clone();
        }

        let mut out = Vec::new();
        if let Some(candidate) = resp.candidates.as_ref().and_then(|c| c.first()) {
            if let Some(content) = &candidate.content {
                if !content.parts.is_empty() && !self.message_start_sent {
                    out.push(self.emit_message_start(&resp));
                }
                for part in &content.parts {
                    out.extend(self.process_part(part));
                }
            }
            if candidate.finish_reason.as_deref() == Some("MAX_TOKENS") {
                self.saw_max_tokens = true;
            }
        }
        out
    }

    fn emit_message_start(&mut self, resp: &GeminiResponse) -> Bytes {
        let usage = resp
            .usage_metadata
            .as_ref()
            .map(|u| {
                let prompt = u.prompt_token_count.unwrap_or(0);
                let cached = u.cached_content_token_count.unwrap_or(0);
                json!({
                    "input_tokens": prompt.saturating_sub(cached),
                    "output_tokens": 0,
                    "cache_read_input_tokens": cached,
                    "cache_creation_input_tokens": 0
                })
            })
            .unwrap_or_else(|| {
                json!({
                    "input_tokens": 0,
                    "output_tokens": 0,
                    "cache_read_input_tokens": 0,
                    "cache_creation_input_tokens": 0
                })
            });

        let message = json!({
            "id": resp.response_id.clone()
                .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple())),
            "type": "message",
            "role": "assistant",
            "content": [],
            "model": resp.model_version.clone().unwrap_or_else(|| self.model.clone()),
            "stop_reason": null,
            "stop_sequence": null,
            "usage": usage,
        });

        self.message_start_sent = true;
        self.emit("message_start", json!({ "type": "message_start", "message": message }))
    }

    fn process_part(&mut self, part: &GeminiPart) -> Vec<Bytes> {
        let signature =
            valid_signature(part.thought_signature.as_ref().map(decode_signature).as_ref());

        if let Some(fc) = &part.function_call {
            return self.process_function_call(fc, signature);
        }

        if let Some(text) = &part.text {
            if part.thought.unwrap_or(false) {
                return self.process_thinking(text, signature);
            }
            return self.process_text(text);
        }

        vec![]
    }

    fn process_thinking(&mut self, text: &str, signature: Option<String>) -> Vec<Bytes> {
        let mut out = Vec::new();

        if self.block_type != BlockType::Thinking {
            out.extend(self.start_block(
                BlockType::Thinking,
                json!({ "type": "thinking", "thinking": "" }),
            ));
        }

        if !text.is_empty() {
            out.push(self.emit_delta(json!({ "type": "thinking_delta", "thinking": text })));
        }

        if let Some(sig) = signature {
            SignatureCache::global().cache_thinking_family(sig.clone(), self.model.clone());
            self.pending_signature = Some(sig);
        }
        out
    }

    fn process_text(&mut self, text: &str) -> Vec<Bytes> {
        if text.trim().is_empty() {
            return vec![];
        }

        let mut out = Vec::new();
        if self.block_type != BlockType::Text {
            out.extend(self.start_block(BlockType::Text, json!({ "type": "text", "text": "" })));
        }
        out.push(self.emit_delta(json!({ "type": "text_delta", "text": text })));
        out
    }

    fn process_function_call(
        &mut self,
        fc: &multiclaude_types::protocol::gemini::FunctionCall,
        signature: Option<String>,
    ) -> Vec<Bytes> {
        self.used_tool = true;

        let tool_id = fc
            .id
            .clone()
            .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple()));

        let mut content_block = json!({
            "type": "tool_use",
            "id": tool_id,
            "name": fc.name,
            "input": {}
        });
        if let Some(sig) = &signature {
            content_block["signature"] = json!(sig);
            SignatureCache::global().cache_tool_signature(&tool_id, sig.clone());
            SignatureCache::global().cache_thinking_family(sig.clone(), self.model.clone());
        }

        let mut out = self.start_block(BlockType::ToolUse, content_block);

        let args_json = fc
            .args
            .as_ref()
            .map(|a| serde_json::to_string(a).unwrap_or_else(|_| "{}".to_string()))
            .unwrap_or_else(|| "{}".to_string());
        out.push(self.emit_delta(json!({ "type": "input_json_delta", "partial_json": args_json })));

        out.extend(self.end_block());
        out
    }

    fn start_block(&mut self, block_type: BlockType, content_block: Value) -> Vec<Bytes> {
        let mut out = Vec::new();
        if self.block_type != BlockType::None {
            out.extend(self.end_block());
        }
        out.push(self.emit(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": self.block_index,
                "content_block": content_block
            }),
        ));
        self.block_type = block_type;
        out
    }

    fn end_block(&mut self) -> Vec<Bytes> {
        if self.block_type == BlockType::None {
            return vec![];
        }

        let mut out = Vec::new();
        if self.block_type == BlockType::Thinking {
            if let Some(sig) = self.pending_signature.take() {
                out.push(self.emit_delta(json!({ "type": "signature_delta", "signature": sig })));
            }
        }
        out.push(self.emit(
            "content_block_stop",
            json!({ "type": "content_block_stop", "index": self.block_index }),
        ));
        self.block_index += 1;
        self.block_type = BlockType::None;
        out
    }

    /// Close the message: shut any open block, then message_delta (usage
    /// omits input_tokens) and message_stop.
    pub fn finish(&mut self) -> Vec<Bytes> {
        let mut out = self.end_block();

        let stop_reason = if self.saw_max_tokens {
            "max_tokens"
        } else if self.used_tool {
            "tool_use"
        } else {
            "end_turn"
        };

        let usage = self
            .last_usage
            .as_ref()
            .map(|u| {
                json!({
                    "output_tokens": u.candidates_token_count.unwrap_or(0),
                    "cache_read_input_tokens": u.cached_content_token_count.unwrap_or(0)
                })
            })
            .unwrap_or_else(|| json!({ "output_tokens": 0 }));

        out.push(self.emit(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": { "stop_reason": stop_reason, "stop_sequence": null },
                "usage": usage
            }),
        ));
        out.push(Bytes::from("event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n"));
        out
    }
}

/// Some stream variants base64-wrap the signature; unwrap it when the
/// payload decodes to clean UTF-8, otherwise keep the raw value.
fn decode_signature(signature: &String) -> String {
    use base64::Engine;
    match base64::engine::general_purpose::STANDARD.decode(signature) {
        Ok(decoded) => match String::from_utf8(decoded) {
            Ok(text) => text,
            Err(_) => signature.clone(),
        },
        Err(_) => signature.clone(),
    }
}

impl crate::mappers::sse::SseMachine for StreamingState {
    fn process_payload(&mut self, payload: &Value) -> Vec<Bytes> {
        self.process_chunk(payload)
    }

    fn finish(&mut self) -> Vec<Bytes> {
        StreamingState::finish(self)
    }
}

/// Extract the JSON payload of a `data:` line. Everything else (comments,
/// event names, `[DONE]`, blank lines) is ignored.
pub fn parse_data_line(line: &str) -> Option<Value> {
    let rest = line.strip_prefix("data:")?.trim();
    if rest.is_empty() || rest == "[DONE]" {
        return None;
    }
    serde_json::from_str(rest).ok()
}

/// The canned six-event completion informing the client that every retry
/// produced an empty response.
pub fn empty_response_fallback_events(model: &str) -> Vec<Bytes> {
    let mut state = StreamingState::new(model);
    let mut out = Vec::new();

    out.push(state.emit(
        "message_start",
        json!({
            "type": "message_start",
            "message": {
                "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
                "type": "message",
                "role": "assistant",
                "content": [],
                "model": model,
                "stop_reason": null,
                "stop_sequence": null,
                "usage": {
                    "input_tokens": 0,
                    "output_tokens": 0,
                    "cache_read_input_tokens": 0,
                    "cache_creation_input_tokens": 0
                }
            }
        }),
    ));
    state.message_start_sent = true;
    out.extend(state.start_block(BlockType::Text, json!({ "type": "text", "text": "" })));
    out.push(state.emit_delta(json!({ "type": "text_delta", "text": EMPTY_RESPONSE_FALLBACK_TEXT })));
    out.extend(state.finish());
    out
}
