//! OpenAI SSE streams → Anthropic streaming events.
//!
//! Two dialects share the block discipline of the Gemini parser: classic
//! chat.completions deltas and the Responses API event stream.

use bytes::Bytes;
use multiclaude_types::protocol::openai::{ChatChunk, ChatUsage};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockType {
    None,
    Text,
    ToolUse,
}

/// State machine converting OpenAI deltas into Anthropic events.
pub struct OpenAiStreamState {
    block_type: BlockType,
    block_index: usize,
    message_start_sent: bool,
    used_tool: bool,
    saw_length: bool,
    model: String,
    usage: Option<ChatUsage>,
    /// Upstream tool-call slot currently being streamed.
    current_tool_slot: Option<usize>,
}

impl OpenAiStreamState {
    pub fn new(model: &str) -> Self {
        Self {
            block_type: BlockType::None,
            block_index: 0,
            message_start_sent: false,
            used_tool: false,
            saw_length: false,
            model: model.to_string(),
            usage: None,
            current_tool_slot: None,
        }
    }

    pub fn has_emitted(&self) -> bool {
        self.message_start_sent
    }

    fn emit(&self, event_type: &str, data: Value) -> Bytes {
        Bytes::from(format!(
            "event: {}\ndata: {}\n\n",
            event_type,
            serde_json::to_string(&data).unwrap_or_default()
        ))
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

    fn ensure_message_start(&mut self, out: &mut Vec<Bytes>, id: Option<&str>, model: Option<&str>) {
        if self.message_start_sent {
            return;
        }
        self.message_start_sent = true;
        out.push(self.emit(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": id.map(|s| s.to_string())
                        .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple())),
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": model.unwrap_or(&self.model),
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
    }

    fn end_block(&mut self) -> Vec<Bytes> {
        if self.block_type == BlockType::None {
            return vec![];
        }
        let out = vec![self.emit(
            "content_block_stop",
            json!({ "type": "content_block_stop", "index": self.block_index }),
        )];
        self.block_index += 1;
        self.block_type = BlockType::None;
        self.current_tool_slot = None;
        out
    }

    /// Process one decoded chat.completions chunk.
    pub fn process_chunk(&mut self, chunk: &ChatChunk) -> Vec<Bytes> {
        let mut out = Vec::new();

        if let Some(usage) = &chunk.usage {
            self.usage = Some(usage.clone());
        }

        let Some(choice) = chunk.choices.first() else { return out };

        let has_payload = choice.delta.content.as_ref().map(|c| !c.is_empty()).unwrap_or(false)
            || choice.delta.tool_calls.as_ref().map(|t| !t.is_empty()).unwrap_or(false);
        if has_payload {
            self.ensure_message_start(&mut out, chunk.id.as_deref(), chunk.model.as_deref());
        }

        if let Some(text) = &choice.delta.content {
            if !text.is_empty() {
                if self.block_type != BlockType::Text {
                    out.extend(self.end_block());
                    out.push(self.emit(
                        "content_block_start",
                        json!({
                            "type": "content_block_start",
                            "index": self.block_index,
                            "content_block": { "type": "text", "text": "" }
                        }),
                    ));
                    self.block_type = BlockType::Text;
                }
                out.push(self.emit_delta(json!({ "type": "text_delta", "text": text })));
            }
        }

        if let Some(tool_calls) = &choice.delta.tool_calls {
            for call in tool_calls {
                let starts_new_call = self.block_type != BlockType::ToolUse
                    || self.current_tool_slot != Some(call.index);
                if starts_new_call && call.function.as_ref().and_then(|f| f.name.as_ref()).is_some()
                {
                    out.extend(self.end_block());
                    self.used_tool = true;
                    let name = call
                        .function
                        .as_ref()
                        .and_then(|f| f.name.clone())
                        .unwrap_or_default();
                    let id = call
                        .id
                        .clone()
                        .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple()));
                    out.push(self.emit(
                        "content_block_start",
                        json!({
                            "type": "content_block_start",
                            "index": self.block_index,
                            "content_block": {
                                "type": "tool_use", "id": id, "name": name, "input": {}
                            }
                        }),
                    ));
                    self.block_type = BlockType::ToolUse;
                    self.current_tool_slot = Some(call.index);
                }

                if let Some(arguments) =
                    call.function.as_ref().and_then(|f| f.arguments.as_ref())
                {
                    if !arguments.is_empty() && self.block_type == BlockType::ToolUse {
                        out.push(self.emit_delta(
                            json!({ "type": "input_json_delta", "partial_json": arguments }),
                        ));
                    }
                }
            }
        }

        if let Some(reason) = &choice.finish_reason {
            if reason == "length" {
                self.saw_length = true;
            }
        }

        out
    }

    /// Close the message.
    pub fn finish(&mut self) -> Vec<Bytes> {
        let mut out = self.end_block();

        let stop_reason = if self.saw_length {
            "max_tokens"
        } else if self.used_tool {
            "tool_use"
        } else {
            "end_turn"
        };

        let usage = self
            .usage
            .as_ref()
            .map(|u| json!({ "output_tokens": u.completion_tokens }))
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

    /// Process one Responses API event. The event `type` field selects the
    /// mapping; unknown events are ignored.
    pub fn process_responses_event(&mut self, event: &Value) -> Vec<Bytes> {
        let mut out = Vec::new();
        match event.get("type").and_then(|t| t.as_str()) {
            Some("response.output_text.delta") => {
                if let Some(delta) = event.get("delta").and_then(|d| d.as_str()) {
                    if !delta.is_empty() {
                        self.ensure_message_start(&mut out, None, None);
                        if self.block_type != BlockType::Text {
                            out.extend(self.end_block());
                            out.push(self.emit(
                                "content_block_start",
                                json!({
                                    "type": "content_block_start",
                                    "index": self.block_index,
                                    "content_block": { "type": "text", "text": "" }
                                }),
                            ));
                            self.block_type = BlockType::Text;
                        }
                        out.push(self.emit_delta(json!({ "type": "text_delta", "text": delta })));
                    }
                }
            }
            Some("response.output_item.added") => {
                let item = event.get("item");
                if item.and_then(|i| i.get("type")).and_then(|t| t.as_str())
                    == Some("function_call")
                {
                    self.ensure_message_start(&mut out, None, None);
                    out.extend(self.end_block());
                    self.used_tool = true;
                    let id = item
                        .and_then(|i| i.get("call_id"))
                        .and_then(|c| c.as_str())
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple()));
                    let name = item
                        .and_then(|i| i.get("name"))
                        .and_then(|n| n.as_str())
                        .unwrap_or_default();
                    out.push(self.emit(
                        "content_block_start",
                        json!({
                            "type": "content_block_start",
                            "index": self.block_index,
                            "content_block": {
                                "type": "tool_use", "id": id, "name": name, "input": {}
                            }
                        }),
                    ));
                    self.block_type = BlockType::ToolUse;
                }
            }
            Some("response.function_call_arguments.delta") => {
                if let Some(delta) = event.get("delta").and_then(|d| d.as_str()) {
                    if self.block_type == BlockType::ToolUse && !delta.is_empty() {
                        out.push(self.emit_delta(
                            json!({ "type": "input_json_delta", "partial_json": delta }),
                        ));
                    }
                }
            }
            Some("response.completed") => {
                if let Some(total) =
                    event.pointer("/response/usage/output_tokens").and_then(|v| v.as_u64())
                {
                    self.usage = Some(ChatUsage {
                        prompt_tokens: event
                            .pointer("/response/usage/input_tokens")
                            .and_then(|v| v.as_u64())
                            .unwrap_or(0) as u32,
                        completion_tokens: total as u32,
                        total_tokens: 0,
                    });
                }
                if event.pointer("/response/incomplete_details/reason").and_then(|v| v.as_str())
                    == Some("max_output_tokens")
                {
                    self.saw_length = true;
                }
            }
            _ => {}
        }
        out
    }
}

/// Which decoder to run over a Copilot stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopilotDialect {
    ChatCompletions,
    Responses,
}

/// [`crate::mappers::sse::SseMachine`] adapter pairing the state machine
/// with the wire dialect of the endpoint that was called.
pub struct CopilotMachine {
    state: OpenAiStreamState,
    dialect: CopilotDialect,
}

impl CopilotMachine {
    pub fn new(model: &str, dialect: CopilotDialect) -> Self {
        Self { state: OpenAiStreamState::new(model), dialect }
    }
}

impl crate::mappers::sse::SseMachine for CopilotMachine {
    fn process_payload(&mut self, payload: &Value) -> Vec<Bytes> {
        match self.dialect {
            CopilotDialect::ChatCompletions => {
                match serde_json::from_value::<ChatChunk>(payload.clone()) {
                    Ok(parsed) => self.state.process_chunk(&parsed),
                    Err(_) => vec![],
                }
            }
            CopilotDialect::Responses => self.state.process_responses_event(payload),
        }
    }

    fn finish(&mut self) -> Vec<Bytes> {
        self.state.finish()
    }
}
