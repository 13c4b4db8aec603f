use super::streaming::OpenAiStreamState;
use super::*;
use multiclaude_types::protocol::claude::{
    ClaudeRequest, ContentBlock, Message, MessageContent,
};
use multiclaude_types::protocol::openai::{ChatChunk, ChatContent};
use serde_json::json;

fn base_request(messages: Vec<Message>) -> ClaudeRequest {
    ClaudeRequest {
        model: "claude-sonnet-4-5".into(),
        messages,
        system: Some(multiclaude_types::protocol::claude::SystemPrompt::String(
            "be brief".into(),
        )),
        tools: None,
        stream: false,
        max_tokens: Some(1024),
        temperature: None,
        top_p: None,
        top_k: None,
        thinking: None,
        stop_sequences: None,
        metadata: None,
    }
}

fn join(events: &[bytes::Bytes]) -> String {
    events.iter().map(|b| String::from_utf8_lossy(b).to_string()).collect()
}

#[test]
fn system_prompt_becomes_first_message() {
    let req = base_request(vec![Message::text("user", "hi")]);
    let chat = transform_claude_to_openai(&req, "gpt-4.1");
    assert_eq!(chat.messages[0].role, "system");
    assert!(matches!(&chat.messages[0].content, Some(ChatContent::String(s)) if s == "be brief"));
    assert_eq!(chat.messages[1].role, "user");
}

#[test]
fn tool_results_become_tool_role_messages() {
    let req = base_request(vec![
        Message {
            role: "assistant".into(),
            content: MessageContent::Array(vec![ContentBlock::ToolUse {
                id: "call_9".into(),
                name: "read_file".into(),
                input: json!({"path": "x"}),
                signature: None,
            }]),
        },
        Message {
            role: "user".into(),
            content: MessageContent::Array(vec![ContentBlock::ToolResult {
                tool_use_id: "call_9".into(),
                content: json!([{"type": "text", "text": "contents"}]),
                is_error: None,
            }]),
        },
    ]);

    let chat = transform_claude_to_openai(&req, "gpt-4.1");
    let assistant = chat.messages.iter().find(|m| m.role == "assistant").unwrap();
    let calls = assistant.tool_calls.as_ref().unwrap();
    assert_eq!(calls[0].id, "call_9");
    assert_eq!(calls[0].function.arguments, r#"{"path":"x"}"#);

    let tool = chat.messages.iter().find(|m| m.role == "tool").unwrap();
    assert_eq!(tool.tool_call_id.as_deref(), Some("call_9"));
    assert!(matches!(&tool.content, Some(ChatContent::String(s)) if s == "contents"));

    assert!(has_agent_turns(&chat));
    assert!(!has_image_parts(&chat));
}

#[test]
fn image_blocks_set_vision_detection() {
    let req = base_request(vec![Message {
        role: "user".into(),
        content: MessageContent::Array(vec![
            ContentBlock::Text { text: "what is this".into() },
            ContentBlock::Image {
                source: multiclaude_types::protocol::claude::MediaSource {
                    source_type: "base64".into(),
                    media_type: Some("image/jpeg".into()),
                    data: Some("abcd".into()),
                    url: None,
                },
            },
        ]),
    }]);

    let chat = transform_claude_to_openai(&req, "gpt-4.1");
    assert!(has_image_parts(&chat));
}

#[test]
fn chat_response_converts_tool_calls() {
    let resp: multiclaude_types::protocol::openai::ChatResponse = serde_json::from_value(json!({
        "id": "chatcmpl-1",
        "model": "gpt-4.1",
        "choices": [{
            "message": {
                "content": null,
                "tool_calls": [{
                    "id": "call_1",
                    "type": "function",
                    "function": { "name": "grep", "arguments": "{\"q\":\"x\"}" }
                }]
            },
            "finish_reason": "tool_calls"
        }],
        "usage": { "prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15 }
    }))
    .unwrap();

    let claude = chat_response_to_claude(&resp, "gpt-4.1").unwrap();
    assert_eq!(claude.stop_reason, "tool_use");
    assert_eq!(claude.usage.input_tokens, 10);
    assert!(matches!(&claude.content[0], ContentBlock::ToolUse { name, input, .. }
        if name == "grep" && input == &json!({"q": "x"})));
}

#[test]
fn stream_text_then_tool_call_produces_ordered_blocks() {
    let mut state = OpenAiStreamState::new("gpt-4.1");
    let mut events = Vec::new();

    let text_chunk: ChatChunk = serde_json::from_value(json!({
        "id": "chatcmpl-2",
        "choices": [{ "delta": { "content": "Hello" } }]
    }))
    .unwrap();
    events.extend(state.process_chunk(&text_chunk));

    let tool_chunk: ChatChunk = serde_json::from_value(json!({
        "choices": [{ "delta": { "tool_calls": [{
            "index": 0, "id": "call_2",
            "function": { "name": "grep", "arguments": "{\"q\":" }
        }] } }]
    }))
    .unwrap();
    events.extend(state.process_chunk(&tool_chunk));

    let args_chunk: ChatChunk = serde_json::from_value(json!({
        "choices": [{ "delta": { "tool_calls": [{
            "index": 0,
            "function": { "arguments": "\"x\"}" }
        }] }, "finish_reason": "tool_calls" }]
    }))
    .unwrap();
    events.extend(state.process_chunk(&args_chunk));
    events.extend(state.finish());

    let output = join(&events);
    assert!(output.contains("message_start"));
    assert!(output.contains(r#""type":"text_delta""#));
    // Text block closed before the tool block opened.
    let text_stop = output.find("content_block_stop").unwrap();
    let tool_start = output.find(r#""name":"grep""#).unwrap();
    assert!(text_stop < tool_start);
    assert!(output.contains(r#""partial_json":"{\"q\":""#));
    assert!(output.contains(r#""stop_reason":"tool_use""#));
}

#[test]
fn length_finish_maps_to_max_tokens() {
    let mut state = OpenAiStreamState::new("gpt-4.1");
    let chunk: ChatChunk = serde_json::from_value(json!({
        "choices": [{ "delta": { "content": "partial" }, "finish_reason": "length" }]
    }))
    .unwrap();
    state.process_chunk(&chunk);
    let output = join(&state.finish());
    assert!(output.contains(r#""stop_reason":"max_tokens""#));
}

#[test]
fn responses_dialect_emits_function_call_blocks() {
    let mut state = OpenAiStreamState::new("gpt-5.1-codex");
    let mut events = Vec::new();
    events.extend(state.process_responses_event(&json!({
        "type": "response.output_item.added",
        "item": { "type": "function_call", "call_id": "call_r1", "name": "list_dir" }
    })));
    events.extend(state.process_responses_event(&json!({
        "type": "response.function_call_arguments.delta",
        "delta": "{\"path\":\".\"}"
    })));
    events.extend(state.process_responses_event(&json!({
        "type": "response.completed",
        "response": { "usage": { "input_tokens": 7, "output_tokens": 3 } }
    })));
    events.extend(state.finish());

    let output = join(&events);
    assert!(output.contains(r#""id":"call_r1""#));
    assert!(output.contains(r#""name":"list_dir""#));
    assert!(output.contains(r#""partial_json":"{\"path\":\".\"}"#));
    assert!(output.contains(r#""stop_reason":"tool_use""#));
    assert!(output.contains(r#""output_tokens":3"#));
}
