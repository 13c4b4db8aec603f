//! GitHub Copilot dispatch engine.

pub mod auth;

use async_trait::async_trait;
use bytes::Bytes;
use multiclaude_types::protocol::claude::{ClaudeRequest, ClaudeResponse, ContentBlock, Usage};
use multiclaude_types::protocol::openai::{ChatRequest, ChatResponse};
use multiclaude_types::{Provider, ProxyError};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::{acquire_account, AcquireOutcome, ProviderDispatch, MAX_RETRIES, NETWORK_RETRY_DELAY_MS};
use crate::mappers::openai::streaming::{CopilotDialect, CopilotMachine};
use crate::mappers::openai::{
    chat_response_to_claude, has_agent_turns, has_image_parts, transform_claude_to_openai,
};
use crate::mappers::sse::{probe_sse, ProbeOutcome};
use crate::pool::SharedPool;
use auth::CopilotTokenCache;

const COPILOT_API_BASE: &str = "https://api.githubcopilot.com";

const INTEGRATION_ID: &str = "vscode-chat";
const EDITOR_VERSION: &str = "vscode/1.99.0";
const EDITOR_PLUGIN_VERSION: &str = "copilot-chat/0.26.1";

/// Models advertised when the upstream listing is unreachable.
const STATIC_MODELS: [&str; 3] = ["gpt-4.1", "gpt-5-mini", "o4-mini"];

const MODEL_CACHE_TTL_SECS: i64 = 10 * 60;

#[derive(Clone)]
struct CachedModels {
    /// model id → supported endpoint paths, verbatim from upstream.
    endpoints: std::collections::HashMap<String, Vec<String>>,
    fetched_at: i64,
}

pub struct CopilotDispatch {
    pool: SharedPool,
    http: reqwest::Client,
    tokens: CopilotTokenCache,
    models: RwLock<Option<CachedModels>>,
}

impl CopilotDispatch {
    pub fn new(pool: SharedPool, http: reqwest::Client) -> Self {
        Self { pool, http, tokens: CopilotTokenCache::new(), models: RwLock::new(None) }
    }

    fn max_attempts(&self) -> usize {
        MAX_RETRIES.max(self.pool.account_count(Provider::Copilot) + 1)
    }

    fn request_builder(
        &self,
        url: &str,
        copilot_token: &str,
        chat: &ChatRequest,
    ) -> reqwest::RequestBuilder {
        let initiator = if has_agent_turns(chat) { "agent" } else { "user" };
        let mut builder = self
            .http
            .post(url)
            .bearer_auth(copilot_token)
            .header("Copilot-Integration-Id", INTEGRATION_ID)
            .header("Editor-Version", EDITOR_VERSION)
            .header("Editor-Plugin-Version", EDITOR_PLUGIN_VERSION)
            .header("X-Request-Id", uuid::Uuid::new_v4().to_string())
            .header("X-Initiator", initiator);
        if has_image_parts(chat) {
            builder = builder.header("Copilot-Vision-Request", "true");
        }
        builder
    }

    /// Endpoint for a model: taken verbatim from the upstream models
    /// response, defaulting to chat/completions.
    fn dialect_for(&self, model: &str) -> CopilotDialect {
        let models = self.models.read();
        if let Some(cached) = models.as_ref() {
            if let Some(endpoints) = cached.endpoints.get(model) {
                if !endpoints.iter().any(|e| e.contains("chat/completions"))
                    && endpoints.iter().any(|e| e.contains("responses"))
                {
                    return CopilotDialect::Responses;
                }
            }
        }
        CopilotDialect::ChatCompletions
    }

    async fn refresh_models(&self, copilot_token: &str) {
        let fresh_enough = {
            let cached = self.models.read();
            cached
                .as_ref()
                .map(|c| chrono::Utc::now().timestamp() - c.fetched_at < MODEL_CACHE_TTL_SECS)
                .unwrap_or(false)
        };
        if fresh_enough {
            return;
        }

        let response = self
            .http
            .get(format!("{}/models", COPILOT_API_BASE))
            .bearer_auth(copilot_token)
            .header("Copilot-Integration-Id", INTEGRATION_ID)
            .header("Editor-Version", EDITOR_VERSION)
            .send()
            .await;

        let Ok(response) = response else { return };
        let Ok(parsed) = response.json::<Value>().await else { return };
        let Some(data) = parsed.get("data").and_then(|d| d.as_array()) else { return };

        let mut endpoints = std::collections::HashMap::new();
        for model in data {
            let Some(id) = model.get("id").and_then(|v| v.as_str()) else { continue };
            let supported = model
                .get("supported_endpoints")
                .and_then(|e| e.as_array())
                .map(|arr| {
                    arr.iter().filter_map(|v| v.as_str().map(|s| s.to_string())).collect()
                })
                .unwrap_or_else(|| vec!["/chat/completions".to_string()]);
            endpoints.insert(id.to_string(), supported);
        }

        *self.models.write() = Some(CachedModels {
            endpoints,
            fetched_at: chrono::Utc::now().timestamp(),
        });
    }

    /// Build the Responses API payload from the chat-form request.
    fn to_responses_body(chat: &ChatRequest) -> Value {
        let mut input = Vec::new();
        for msg in &chat.messages {
            match msg.role.as_str() {
                "tool" => {
                    input.push(json!({
                        "type": "function_call_output",
                        "call_id": msg.tool_call_id,
                        "output": content_text(msg),
                    }));
                }
                role => {
                    if let Some(calls) = &msg.tool_calls {
                        for call in calls {
                            input.push(json!({
                                "type": "function_call",
                                "call_id": call.id,
                                "name": call.function.name,
                                "arguments": call.function.arguments,
                            }));
                        }
                    }
                    let text = content_text(msg);
                    if !text.is_empty() {
                        input.push(json!({ "role": role, "content": text }));
                    }
                }
            }
        }

        let mut body = json!({
            "model": chat.model,
            "input": input,
            "stream": chat.stream,
        });
        if let Some(max) = chat.max_tokens {
            body["max_output_tokens"] = json!(max);
        }
        if let Some(tools) = &chat.tools {
            body["tools"] = json!(tools
                .iter()
                .map(|t| json!({
                    "type": "function",
                    "name": t.function.name,
                    "description": t.function.description,
                    "parameters": t.function.parameters,
                }))
                .collect::<Vec<_>>());
        }
        body
    }

    /// Convert a non-streaming Responses API body.
    fn responses_to_claude(raw: &Value, requested_model: &str) -> ClaudeResponse {
        let mut content = Vec::new();
        if let Some(output) = raw.get("output").and_then(|o| o.as_array()) {
            for item in output {
                match item.get("type").and_then(|t| t.as_str()) {
                    Some("message") => {
                        if let Some(parts) = item.get("content").and_then(|c| c.as_array()) {
                            for part in parts {
                                if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                                    if !text.is_empty() {
                                        content.push(ContentBlock::Text { text: text.to_string() });
                                    }
                                }
                            }
                        }
                    }
                    Some("function_call") => {
                        let input = item
                            .get("arguments")
                            .and_then(|a| a.as_str())
                            .and_then(|a| serde_json::from_str(a).ok())
                            .unwrap_or_else(|| json!({}));
                        content.push(ContentBlock::ToolUse {
                            id: item
                                .get("call_id")
                                .and_then(|c| c.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            name: item
                                .get("name")
                                .and_then(|n| n.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            input,
                            signature: None,
                        });
                    }
                    _ => {}
                }
            }
        }

        let has_tool_use = content.iter().any(|b| matches!(b, ContentBlock::ToolUse { .. }));
        let stop_reason = if raw
            .pointer("/incomplete_details/reason")
            .and_then(|r| r.as_str())
            == Some("max_output_tokens")
        {
            "max_tokens"
        } else if has_tool_use {
            "tool_use"
        } else {
            "end_turn"
        };

        ClaudeResponse {
            id: raw
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or("msg_copilot")
                .to_string(),
            type_: "message".to_string(),
            role: "assistant".to_string(),
            model: requested_model.to_string(),
            content,
            stop_reason: stop_reason.to_string(),
            stop_sequence: None,
            usage: Usage {
                input_tokens: raw
                    .pointer("/usage/input_tokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32,
                output_tokens: raw
                    .pointer("/usage/output_tokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32,
                cache_read_input_tokens: None,
                cache_creation_input_tokens: None,
            },
        }
    }

    /// One upstream attempt; classification mirrors the other engines.
    async fn call_upstream(
        &self,
        account: &multiclaude_types::Account,
        chat: &ChatRequest,
        dialect: CopilotDialect,
    ) -> Result<CopilotAttempt, ProxyError> {
        let github_token = account.refresh_token.as_deref().ok_or_else(|| {
            ProxyError::AuthInvalid {
                email: account.email.clone(),
                message: "copilot account has no github token".to_string(),
            }
        })?;

        let copilot_token = match self.tokens.get(&self.http, &account.email, github_token).await {
            Ok(t) => t,
            Err(e @ ProxyError::AuthNetwork { .. }) => return Ok(CopilotAttempt::NetworkError(e)),
            Err(e @ ProxyError::AuthInvalid { .. }) => {
                self.pool.mark_invalid(&account.email, "copilot token exchange rejected");
                return Ok(CopilotAttempt::Rotate(e));
            }
            Err(e) => return Err(e),
        };

        self.refresh_models(&copilot_token).await;

        let (url, body) = match dialect {
            CopilotDialect::ChatCompletions => (
                format!("{}/chat/completions", COPILOT_API_BASE),
                serde_json::to_value(chat)
                    .map_err(|e| ProxyError::Internal { message: e.to_string() })?,
            ),
            CopilotDialect::Responses => {
                (format!("{}/responses", COPILOT_API_BASE), Self::to_responses_body(chat))
            }
        };

        let response = match self.request_builder(&url, &copilot_token, chat).json(&body).send().await
        {
            Ok(r) => r,
            Err(e) => {
                return Ok(CopilotAttempt::NetworkError(ProxyError::Network {
                    message: e.to_string(),
                }))
            }
        };

        let status = response.status();
        if status.is_success() {
            return Ok(CopilotAttempt::Success(response));
        }

        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<i64>().ok());
        let body_text = response.text().await.unwrap_or_default();

        match status.as_u16() {
            429 => {
                let reset = retry_after
                    .map(|s| chrono::Utc::now().timestamp_millis() + s * 1000)
                    .unwrap_or(0);
                self.pool.mark_rate_limited(&account.email, reset, &chat.model);
                Ok(CopilotAttempt::Rotate(ProxyError::RateLimited {
                    provider: Provider::Copilot.to_string(),
                    reset_ms: retry_after.map(|s| s * 1000),
                }))
            }
            401 => {
                self.tokens.invalidate(&account.email);
                Ok(CopilotAttempt::Rotate(ProxyError::Upstream { status: 401, body: body_text }))
            }
            402..=499 => Err(ProxyError::Upstream { status: status.as_u16(), body: body_text }),
            _ => Ok(CopilotAttempt::NetworkError(ProxyError::Upstream {
                status: status.as_u16(),
                body: body_text,
            })),
        }
    }
}

enum CopilotAttempt {
    Success(reqwest::Response),
    Rotate(ProxyError),
    NetworkError(ProxyError),
}

#[async_trait]
impl ProviderDispatch for CopilotDispatch {
    fn provider(&self) -> Provider {
        Provider::Copilot
    }

    fn supports_model(&self, model: &str) -> bool {
        if model.starts_with("gpt") || model.starts_with("o3") || model.starts_with("o4") {
            return true;
        }
        self.models
            .read()
            .as_ref()
            .map(|c| c.endpoints.contains_key(model))
            .unwrap_or(false)
    }

    async fn list_models(&self) -> Vec<Value> {
        let ids: Vec<String> = {
            let cached = self.models.read();
            match cached.as_ref() {
                Some(c) => c.endpoints.keys().cloned().collect(),
                None => STATIC_MODELS.iter().map(|s| s.to_string()).collect(),
            }
        };
        ids.into_iter()
            .map(|id| json!({ "id": id, "type": "model", "display_name": id }))
            .collect()
    }

    async fn send_message(&self, req: &ClaudeRequest) -> Result<ClaudeResponse, ProxyError> {
        let mut chat = transform_claude_to_openai(req, &req.model);
        chat.stream = false;
        let dialect = self.dialect_for(&req.model);
        let mut last_error = ProxyError::NoAccounts { provider: Provider::Copilot.to_string() };

        let mut attempt = 0;
        while attempt < self.max_attempts() {
            let account =
                match acquire_account(&self.pool, Provider::Copilot, &req.model, false, true)
                    .await?
                {
                    AcquireOutcome::Account(a) => a,
                    AcquireOutcome::Fallback(_) => unreachable!("fallback disabled"),
                };

            match self.call_upstream(&account, &chat, dialect).await? {
                CopilotAttempt::Success(response) => {
                    return match dialect {
                        CopilotDialect::ChatCompletions => {
                            let parsed: ChatResponse =
                                response.json().await.map_err(|e| ProxyError::Upstream {
                                    status: 502,
                                    body: format!("unparsable copilot response: {}", e),
                                })?;
                            chat_response_to_claude(&parsed, &req.model)
                        }
                        CopilotDialect::Responses => {
                            let raw: Value =
                                response.json().await.map_err(|e| ProxyError::Upstream {
                                    status: 502,
                                    body: format!("unparsable copilot response: {}", e),
                                })?;
                            Ok(Self::responses_to_claude(&raw, &req.model))
                        }
                    };
                }
                CopilotAttempt::Rotate(e) => {
                    last_error = e;
                    attempt += 1;
                }
                CopilotAttempt::NetworkError(e) => {
                    last_error = e;
                    tokio::time::sleep(std::time::Duration::from_millis(NETWORK_RETRY_DELAY_MS))
                        .await;
                    attempt += 1;
                }
            }
        }

        Err(last_error)
    }

    async fn send_stream(&self, req: &ClaudeRequest) -> Result<mpsc::Receiver<Bytes>, ProxyError> {
        let mut chat = transform_claude_to_openai(req, &req.model);
        chat.stream = true;
        let dialect = self.dialect_for(&req.model);
        let mut last_error = ProxyError::NoAccounts { provider: Provider::Copilot.to_string() };

        let mut attempt = 0;
        while attempt < self.max_attempts() {
            let account =
                match acquire_account(&self.pool, Provider::Copilot, &req.model, false, true)
                    .await?
                {
                    AcquireOutcome::Account(a) => a,
                    AcquireOutcome::Fallback(_) => unreachable!("fallback disabled"),
                };

            match self.call_upstream(&account, &chat, dialect).await? {
                CopilotAttempt::Success(response) => {
                    match probe_sse(response, CopilotMachine::new(&req.model, dialect)).await {
                        Ok(ProbeOutcome::Content(probed)) => return Ok(probed.into_receiver()),
                        Ok(ProbeOutcome::Empty) => {
                            last_error = ProxyError::EmptyResponse;
                            attempt += 1;
                        }
                        Err(e) => {
                            last_error = e;
                            attempt += 1;
                        }
                    }
                }
                CopilotAttempt::Rotate(e) => {
                    last_error = e;
                    attempt += 1;
                }
                CopilotAttempt::NetworkError(e) => {
                    last_error = e;
                    tokio::time::sleep(std::time::Duration::from_millis(NETWORK_RETRY_DELAY_MS))
                        .await;
                    attempt += 1;
                }
            }
        }

        Err(last_error)
    }

    async fn get_status(&self) -> Value {
        let now = chrono::Utc::now().timestamp_millis();
        let entries: Vec<Value> = self
            .pool
            .list_accounts()
            .iter()
            .filter(|a| a.provider == Provider::Copilot)
            .map(|a| {
                json!({
                    "email": a.email,
                    "invalid": a.is_invalid,
                    "tier": a.copilot_tier,
                    "rate_limited": a.model_rate_limits.values().any(|l| l.is_active(now)),
                })
            })
            .collect();
        json!({ "provider": "copilot", "accounts": entries })
    }
}

fn content_text(msg: &multiclaude_types::protocol::openai::ChatMessage) -> String {
    use multiclaude_types::protocol::openai::{ChatContent, ChatContentPart};
    match &msg.content {
        Some(ChatContent::String(s)) => s.clone(),
        Some(ChatContent::Parts(parts)) => parts
            .iter()
            .filter_map(|p| match p {
                ChatContentPart::Text { text } => Some(text.as_str()),
                ChatContentPart::ImageUrl { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        None => String::new(),
    }
}
