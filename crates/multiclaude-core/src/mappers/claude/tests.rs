use super::streaming::{
    empty_response_fallback_events, parse_data_line, StreamingState, EMPTY_RESPONSE_FALLBACK_TEXT,
};
use super::*;
use multiclaude_types::protocol::claude::{ContentBlock, Message, MessageContent};
use multiclaude_types::protocol::gemini::{
    Candidate, FunctionCall, GeminiContent, GeminiPart, GeminiResponse,
};
use serde_json::json;

fn sig(tag: &str) -> String {
    format!("{}{}", tag, "s".repeat(MIN_SIGNATURE_LENGTH))
}

fn join(events: &[bytes::Bytes]) -> String {
    events.iter().map(|b| String::from_utf8_lossy(b).to_string()).collect()
}

// ===== reorder =====

#[test]
fn reorder_moves_text_before_tool_use_and_drops_whitespace() {
    let mut blocks = vec![
        ContentBlock::ToolUse { id: "t1".into(), name: "grep".into(), input: json!({}), signature: None },
        ContentBlock::Text { text: "hello".into() },
        ContentBlock::Text { text: "   ".into() },
        ContentBlock::Text { text: "".into() },
    ];
    reorder_assistant_blocks(&mut blocks);

    assert_eq!(blocks.len(), 2);
    assert!(matches!(&blocks[0], ContentBlock::Text { text } if text == "hello"));
    assert!(matches!(&blocks[1], ContentBlock::ToolUse { id, .. } if id == "t1"));
}

#[test]
fn reorder_puts_signed_thinking_first_and_drops_unsigned() {
    let mut blocks = vec![
        ContentBlock::Text { text: "answer".into() },
        ContentBlock::Thinking { thinking: "signed".into(), signature: Some(sig("a")) },
        ContentBlock::Thinking { thinking: "unsigned".into(), signature: None },
        ContentBlock::Thinking { thinking: "short-sig".into(), signature: Some("tiny".into()) },
    ];
    reorder_assistant_blocks(&mut blocks);

    assert_eq!(blocks.len(), 2);
    assert!(matches!(&blocks[0], ContentBlock::Thinking { thinking, .. } if thinking == "signed"));
    assert!(matches!(&blocks[1], ContentBlock::Text { .. }));
}

#[test]
fn reorder_is_idempotent() {
    let mut blocks = vec![
        ContentBlock::ToolUse { id: "t1".into(), name: "grep".into(), input: json!({"q": 1}), signature: None },
        ContentBlock::Thinking { thinking: "th".into(), signature: Some(sig("b")) },
        ContentBlock::Text { text: "body".into() },
    ];
    reorder_assistant_blocks(&mut blocks);
    let once = serde_json::to_value(&blocks).unwrap();
    reorder_assistant_blocks(&mut blocks);
    assert_eq!(once, serde_json::to_value(&blocks).unwrap());
}

// ===== request/response round trip =====

#[test]
fn round_trip_preserves_role_text_and_tool_use() {
    let messages = vec![Message {
        role: "assistant".to_string(),
        content: MessageContent::Array(vec![
            ContentBlock::Text { text: "running a search".into() },
            ContentBlock::ToolUse {
                id: "toolu_roundtrip".into(),
                name: "grep".into(),
                input: json!({"pattern": "fn main"}),
                signature: None,
            },
        ]),
    }];

    let contents = build_contents(&messages, ModelFamily::Claude);
    assert_eq!(contents.len(), 1);
    assert_eq!(contents[0].role, "model");

    let response = GeminiResponse {
        candidates: Some(vec![Candidate {
            content: Some(GeminiContent {
                role: "model".into(),
                parts: contents[0].parts.clone(),
            }),
            finish_reason: Some("STOP".into()),
            index: Some(0),
        }]),
        ..Default::default()
    };

    let claude = transform_response(&response, "claude-sonnet-4-5").unwrap();
    assert_eq!(claude.role, "assistant");
    assert!(claude
        .content
        .iter()
        .any(|b| matches!(b, ContentBlock::Text { text } if text == "running a search")));
    let tool = claude
        .content
        .iter()
        .find_map(|b| match b {
            ContentBlock::ToolUse { id, name, input, .. } => Some((id, name, input)),
            _ => None,
        })
        .unwrap();
    assert_eq!(tool.0, "toolu_roundtrip");
    assert_eq!(tool.1, "grep");
    assert_eq!(tool.2, &json!({"pattern": "fn main"}));
    // Any tool call promotes STOP to tool_use.
    assert_eq!(claude.stop_reason, "tool_use");
}

#[test]
fn gemini_targets_get_placeholder_signature_on_tool_use() {
    let messages = vec![Message {
        role: "assistant".to_string(),
        content: MessageContent::Array(vec![ContentBlock::ToolUse {
            id: "toolu_nosig".into(),
            name: "read_file".into(),
            input: json!({"path": "a.rs"}),
            signature: None,
        }]),
    }];

    let contents = build_contents(&messages, ModelFamily::Gemini);
    let part = &contents[0].parts[0];
    assert_eq!(part.thought_signature.as_deref(), Some(SKIP_SIGNATURE_PLACEHOLDER));
    // Gemini matches calls by name, not id.
    assert!(part.function_call.as_ref().unwrap().id.is_none());
}

#[test]
fn tool_result_with_only_images_reports_image_attached() {
    let messages = vec![Message {
        role: "user".to_string(),
        content: MessageContent::Array(vec![ContentBlock::ToolResult {
            tool_use_id: "toolu_img".into(),
            content: json!([
                {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "aGk="}}
            ]),
            is_error: None,
        }]),
    }];

    let contents = build_contents(&messages, ModelFamily::Gemini);
    let parts = &contents[0].parts;
    assert_eq!(parts.len(), 2);
    let fr = parts[0].function_response.as_ref().unwrap();
    assert_eq!(fr.name, "toolu_img");
    assert_eq!(fr.response["result"], "Image attached");
    assert_eq!(parts[1].inline_data.as_ref().unwrap().data, "aGk=");
}

#[test]
fn session_id_is_stable_for_same_first_user_message() {
    let messages = vec![Message::text("user", "hello world")];
    let a = request::derive_session_id(&messages);
    let b = request::derive_session_id(&messages);
    assert_eq!(a, b);
    assert_eq!(a.len(), 32);

    let other = vec![Message::text("user", "different")];
    assert_ne!(a, request::derive_session_id(&other));
}

#[test]
fn transform_request_raises_max_tokens_below_thinking_budget() {
    let req = multiclaude_types::protocol::claude::ClaudeRequest {
        model: "claude-sonnet-4-5".into(),
        messages: vec![Message::text("user", "hi")],
        system: None,
        tools: None,
        stream: false,
        max_tokens: Some(4_096),
        temperature: None,
        top_p: None,
        top_k: None,
        thinking: Some(multiclaude_types::protocol::claude::ThinkingConfig {
            type_: "enabled".into(),
            budget_tokens: Some(8_000),
        }),
        stop_sequences: None,
        metadata: None,
    };

    let body = transform_claude_request(&req, "proj-1").unwrap();
    let max = body["request"]["generationConfig"]["maxOutputTokens"].as_u64().unwrap();
    assert_eq!(max, 8_000 + 8_192);
    assert_eq!(body["project"], "proj-1");
    assert_eq!(body["request"]["generationConfig"]["thinkingConfig"]["thinkingBudget"], 8_000);
}

// ===== thinking analysis =====

#[test]
fn tool_results_counted_per_message_not_per_block() {
    let messages = vec![
        Message::text("user", "do it"),
        Message {
            role: "assistant".into(),
            content: MessageContent::Array(vec![
                ContentBlock::ToolUse { id: "t1".into(), name: "a".into(), input: json!({}), signature: None },
                ContentBlock::ToolUse { id: "t2".into(), name: "b".into(), input: json!({}), signature: None },
            ]),
        },
        Message {
            role: "user".into(),
            content: MessageContent::Array(vec![
                ContentBlock::ToolResult { tool_use_id: "t1".into(), content: json!("ok"), is_error: None },
                ContentBlock::ToolResult { tool_use_id: "t2".into(), content: json!("ok"), is_error: None },
            ]),
        },
    ];

    let analysis = analyze_conversation(&messages);
    assert_eq!(analysis.tool_result_count, 1);
    assert!(analysis.in_tool_loop);
    assert!(!analysis.interrupted_tool);

    let mut repaired = messages.clone();
    repair_thinking(&mut repaired, ModelFamily::Gemini);
    // Singular closure text for a single result message, plus [Continue].
    assert_eq!(repaired.len(), messages.len() + 2);
    let closure = &repaired[repaired.len() - 2];
    assert!(matches!(&closure.content, MessageContent::String(s) if s == "[Tool execution completed.]"));
    let cont = &repaired[repaired.len() - 1];
    assert_eq!(cont.role, "user");
    assert!(matches!(&cont.content, MessageContent::String(s) if s == "[Continue]"));
}

#[test]
fn plural_closure_for_multiple_result_messages() {
    let tool_use = |id: &str| Message {
        role: "assistant".into(),
        content: MessageContent::Array(vec![ContentBlock::ToolUse {
            id: id.into(),
            name: "x".into(),
            input: json!({}),
            signature: None,
        }]),
    };
    let tool_result = |id: &str| Message {
        role: "user".into(),
        content: MessageContent::Array(vec![ContentBlock::ToolResult {
            tool_use_id: id.into(),
            content: json!("ok"),
            is_error: None,
        }]),
    };

    let mut messages = vec![
        Message::text("user", "go"),
        tool_use("t1"),
        tool_result("t1"),
        tool_result("t2"),
    ];
    // The last assistant is the tool_use turn; two result messages follow.
    repair_thinking(&mut messages, ModelFamily::Gemini);
    let closure = &messages[messages.len() - 2];
    assert!(
        matches!(&closure.content, MessageContent::String(s) if s == "[2 tool executions completed.]")
    );
}

#[test]
fn interrupted_tool_injects_synthetic_assistant_turn() {
    let mut messages = vec![
        Message::text("user", "go"),
        Message {
            role: "assistant".into(),
            content: MessageContent::Array(vec![ContentBlock::ToolUse {
                id: "t1".into(),
                name: "x".into(),
                input: json!({}),
                signature: None,
            }]),
        },
        Message::text("user", "never mind, do something else"),
    ];

    let analysis = analyze_conversation(&messages);
    assert!(analysis.interrupted_tool);
    assert!(!analysis.in_tool_loop);

    repair_thinking(&mut messages, ModelFamily::Gemini);
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[2].role, "assistant");
    assert!(
        matches!(&messages[2].content, MessageContent::String(s) if s == "[Tool call was interrupted.]")
    );
}

#[test]
fn no_repair_when_last_turn_has_signed_thinking() {
    let messages = vec![
        Message::text("user", "go"),
        Message {
            role: "assistant".into(),
            content: MessageContent::Array(vec![
                ContentBlock::Thinking { thinking: "hm".into(), signature: Some(sig("c")) },
                ContentBlock::ToolUse { id: "t1".into(), name: "x".into(), input: json!({}), signature: None },
            ]),
        },
        Message {
            role: "user".into(),
            content: MessageContent::Array(vec![ContentBlock::ToolResult {
                tool_use_id: "t1".into(),
                content: json!("ok"),
                is_error: None,
            }]),
        },
    ];

    let mut repaired = messages.clone();
    repair_thinking(&mut repaired, ModelFamily::Gemini);
    assert_eq!(repaired.len(), messages.len());
}

#[test]
fn claude_target_repairs_only_with_gemini_style_history() {
    let base = vec![
        Message::text("user", "go"),
        Message {
            role: "assistant".into(),
            content: MessageContent::Array(vec![ContentBlock::ToolUse {
                id: "t1".into(),
                name: "x".into(),
                input: json!({}),
                signature: None,
            }]),
        },
        Message {
            role: "user".into(),
            content: MessageContent::Array(vec![ContentBlock::ToolResult {
                tool_use_id: "t1".into(),
                content: json!("ok"),
                is_error: None,
            }]),
        },
    ];

    // Anthropic-native history: leave it alone.
    let mut untouched = base.clone();
    repair_thinking(&mut untouched, ModelFamily::Claude);
    assert_eq!(untouched.len(), base.len());

    // Gemini-style signature on the tool_use: repair applies.
    let mut gemini_style = base.clone();
    if let MessageContent::Array(blocks) = &mut gemini_style[1].content {
        if let ContentBlock::ToolUse { signature, .. } = &mut blocks[0] {
            *signature = Some(sig("d"));
        }
    }
    repair_thinking(&mut gemini_style, ModelFamily::Claude);
    assert_eq!(gemini_style.len(), base.len() + 2);
}

// ===== streaming =====

#[test]
fn empty_stream_chunk_emits_nothing() {
    let mut state = StreamingState::new("gemini-3-pro");
    let events = state.process_chunk(&json!({
        "response": { "candidates": [{ "content": { "role": "model", "parts": [] } }] }
    }));
    assert!(events.is_empty());
    assert!(!state.has_emitted());
}

#[test]
fn text_stream_emits_message_start_then_deltas() {
    let mut state = StreamingState::new("gemini-3-pro");
    let events = state.process_chunk(&json!({
        "response": {
            "responseId": "resp-1",
            "usageMetadata": { "promptTokenCount": 100, "cachedContentTokenCount": 40 },
            "candidates": [{ "content": { "role": "model", "parts": [{ "text": "Hello" }] } }]
        }
    }));

    let output = join(&events);
    assert!(output.contains("event: message_start"));
    assert!(output.contains(r#""input_tokens":60"#));
    assert!(output.contains(r#""cache_read_input_tokens":40"#));
    assert!(output.contains(r#""type":"text_delta""#));
    assert!(output.contains("Hello"));
}

#[test]
fn whitespace_text_does_not_open_a_block() {
    let mut state = StreamingState::new("gemini-3-pro");
    let events = state.process_chunk(&json!({
        "candidates": [{ "content": { "role": "model", "parts": [{ "text": "   " }] } }]
    }));
    // message_start fires (the chunk has parts) but no block opens.
    let output = join(&events);
    assert!(output.contains("message_start"));
    assert!(!output.contains("content_block_start"));
}

#[test]
fn signature_delta_flushes_before_thinking_block_closes() {
    let mut state = StreamingState::new("gemini-3-pro");
    let signature = sig("stream");
    let mut events = state.process_chunk(&json!({
        "candidates": [{ "content": { "role": "model", "parts": [
            { "text": "pondering", "thought": true, "thoughtSignature": signature }
        ] } }]
    }));
    events.extend(state.process_chunk(&json!({
        "candidates": [{ "content": { "role": "model", "parts": [{ "text": "done" }] } }]
    })));

    let output = join(&events);
    let sig_pos = output.find("signature_delta").unwrap();
    let stop_pos = output.find("content_block_stop").unwrap();
    assert!(sig_pos < stop_pos);
    assert!(output.contains(&signature));
}

#[test]
fn stop_after_function_call_maps_to_tool_use() {
    let mut state = StreamingState::new("gemini-3-pro");
    state.process_chunk(&json!({
        "candidates": [{ "content": { "role": "model", "parts": [
            { "functionCall": { "name": "grep", "args": { "pattern": "x" } } }
        ] } }]
    }));
    state.process_chunk(&json!({
        "candidates": [{ "content": { "role": "model", "parts": [] }, "finishReason": "STOP" }]
    }));

    let output = join(&state.finish());
    assert!(output.contains(r#""stop_reason":"tool_use""#));
}

#[test]
fn max_tokens_outranks_tool_use() {
    let mut state = StreamingState::new("gemini-3-pro");
    state.process_chunk(&json!({
        "candidates": [{ "content": { "role": "model", "parts": [
            { "functionCall": { "name": "grep", "args": {} } }
        ] } }]
    }));
    state.process_chunk(&json!({
        "candidates": [{ "content": { "role": "model", "parts": [] }, "finishReason": "MAX_TOKENS" }]
    }));

    let output = join(&state.finish());
    assert!(output.contains(r#""stop_reason":"max_tokens""#));
}

#[test]
fn function_call_emits_single_full_json_delta() {
    let mut state = StreamingState::new("gemini-3-pro");
    let events = state.process_chunk(&json!({
        "candidates": [{ "content": { "role": "model", "parts": [
            { "functionCall": { "name": "grep", "id": "call_1", "args": { "pattern": "fn" } } }
        ] } }]
    }));

    let output = join(&events);
    assert!(output.contains(r#""type":"content_block_start""#));
    assert!(output.contains(r#""name":"grep""#));
    assert!(output.contains(r#""input":{}"#));
    assert!(output.contains(r#""type":"input_json_delta""#));
    assert!(output.contains(r#"partial_json":"{\"pattern\":\"fn\"}"#));
    assert!(output.contains(r#""type":"content_block_stop""#));
}

#[test]
fn fallback_message_is_six_events_with_notice_text() {
    let events = empty_response_fallback_events("gemini-3-pro");
    assert_eq!(events.len(), 6);
    let output = join(&events);
    assert!(output.contains("message_start"));
    assert!(output.contains(EMPTY_RESPONSE_FALLBACK_TEXT));
    assert!(output.contains(r#""stop_reason":"end_turn""#));
    assert!(output.contains("message_stop"));
}

#[test]
fn data_line_parsing_ignores_noise() {
    assert!(parse_data_line("event: ping").is_none());
    assert!(parse_data_line(": comment").is_none());
    assert!(parse_data_line("data: [DONE]").is_none());
    assert!(parse_data_line("data: {\"a\":1}").is_some());
    assert!(parse_data_line("").is_none());
}
