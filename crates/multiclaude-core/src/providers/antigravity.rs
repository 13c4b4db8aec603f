//! Antigravity (Google Cloud Code) dispatch engine.

use async_trait::async_trait;
use bytes::Bytes;
use multiclaude_types::protocol::claude::{ClaudeRequest, ClaudeResponse};
use multiclaude_types::protocol::gemini::GeminiResponse;
use multiclaude_types::{Provider, ProxyError};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{
    acquire_account, AcquireOutcome, ProviderDispatch, EMPTY_RETRY_BASE_DELAY_MS,
    MAX_EMPTY_RESPONSE_RETRIES, MAX_RETRIES, NETWORK_RETRY_DELAY_MS,
};
use crate::mappers::claude::streaming::{empty_response_fallback_events, StreamingState};
use crate::mappers::claude::{transform_claude_request, transform_response, ModelFamily};
use crate::mappers::sse::{canned_events, probe_sse, ProbeOutcome};
use crate::pool::SharedPool;
use crate::upstream::{AntigravityClient, UpstreamOutcome, INTERLEAVED_THINKING_BETA};

/// Models always advertised even when the upstream listing is unreachable.
const STATIC_MODELS: [&str; 5] = [
    "claude-sonnet-4-5",
    "claude-opus-4-5",
    "gemini-3-pro-preview",
    "gemini-2.5-pro",
    "gemini-2.5-flash",
];

/// Inner 5xx retries allowed while recovering from an empty response.
const MAX_EMPTY_RETRY_5XX: u32 = 2;

pub struct AntigravityDispatch {
    pool: SharedPool,
    client: AntigravityClient,
    fallback_enabled: bool,
}

/// What one full attempt produced.
enum AttemptOutcome<T> {
    Done(T),
    /// Rotate to the next account.
    Rotate(ProxyError),
    /// Rotate after the network settle delay.
    RotateAfterDelay(ProxyError),
}

impl AntigravityDispatch {
    pub fn new(pool: SharedPool, http: reqwest::Client, fallback_enabled: bool) -> Self {
        Self { pool, client: AntigravityClient::new(http), fallback_enabled }
    }

    fn extra_headers(req: &ClaudeRequest, model: &str) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        let thinking = req.thinking.as_ref().map(|t| t.is_enabled()).unwrap_or(false);
        if ModelFamily::of(model) == ModelFamily::Claude && thinking && req.tools.is_some() {
            headers.insert("anthropic-beta".to_string(), INTERLEAVED_THINKING_BETA.to_string());
        }
        headers
    }

    /// Resolve credentials and build the upstream payload for one attempt.
    async fn prepare(
        &self,
        req: &ClaudeRequest,
        model: &str,
        account: &multiclaude_types::Account,
    ) -> Result<AttemptOutcome<(String, Value)>, ProxyError> {
        let token = match self.pool.get_token(account).await {
            Ok(t) => t,
            Err(e @ ProxyError::AuthNetwork { .. }) => {
                return Ok(AttemptOutcome::RotateAfterDelay(e))
            }
            Err(e @ ProxyError::AuthInvalid { .. }) => return Ok(AttemptOutcome::Rotate(e)),
            Err(e) => return Err(e),
        };

        let project = match self.pool.get_project(account, &token).await {
            Ok(p) => p,
            Err(e) => return Ok(AttemptOutcome::Rotate(e)),
        };

        let mut request = req.clone();
        request.model = model.to_string();
        let body = transform_claude_request(&request, &project)?;
        Ok(AttemptOutcome::Done((token, body)))
    }

    /// Classify a failed upstream outcome into the retry decision.
    fn classify_failure(
        &self,
        outcome: UpstreamOutcome,
        email: &str,
        model: &str,
    ) -> Result<AttemptOutcome<reqwest::Response>, ProxyError> {
        match outcome {
            UpstreamOutcome::Success(resp) => Ok(AttemptOutcome::Done(resp)),
            UpstreamOutcome::RateLimited { min_reset_ms } => {
                self.pool.mark_rate_limited(email, min_reset_ms, model);
                Ok(AttemptOutcome::Rotate(ProxyError::RateLimited {
                    provider: Provider::Antigravity.to_string(),
                    reset_ms: Some(min_reset_ms),
                }))
            }
            UpstreamOutcome::Fatal { status: 401, body } => {
                // Stale cached token; the next attempt refreshes.
                self.pool.invalidate_auth(email);
                Ok(AttemptOutcome::Rotate(ProxyError::Upstream { status: 401, body }))
            }
            UpstreamOutcome::Fatal { status, body } => {
                Err(ProxyError::Upstream { status, body })
            }
            UpstreamOutcome::Unavailable { message } => {
                Ok(AttemptOutcome::RotateAfterDelay(ProxyError::Network { message }))
            }
        }
    }

    fn max_attempts(&self) -> usize {
        MAX_RETRIES.max(self.pool.account_count(Provider::Antigravity) + 1)
    }
}

#[async_trait]
impl ProviderDispatch for AntigravityDispatch {
    fn provider(&self) -> Provider {
        Provider::Antigravity
    }

    fn supports_model(&self, model: &str) -> bool {
        model.starts_with("claude") || model.starts_with("gemini")
    }

    async fn list_models(&self) -> Vec<Value> {
        let mut ids: Vec<String> = Vec::new();

        if let Some(account) = self.pool.pick_next(Provider::Antigravity, "") {
            if let Ok(token) = self.pool.get_token(&account).await {
                if let UpstreamOutcome::Success(resp) =
                    self.client.fetch_available_models(&token).await
                {
                    if let Ok(parsed) = resp.json::<Value>().await {
                        if let Some(models) = parsed.get("models").and_then(|m| m.as_array()) {
                            ids = models
                                .iter()
                                .filter_map(|m| {
                                    m.get("modelId")
                                        .or_else(|| m.get("name"))
                                        .and_then(|v| v.as_str())
                                        .map(|s| s.to_string())
                                })
                                .collect();
                        }
                    }
                }
            }
        }

        if ids.is_empty() {
            ids = STATIC_MODELS.iter().map(|s| s.to_string()).collect();
        }

        ids.into_iter()
            .map(|id| json!({ "id": id, "type": "model", "display_name": id }))
            .collect()
    }

    async fn send_message(&self, req: &ClaudeRequest) -> Result<ClaudeResponse, ProxyError> {
        let mut model = req.model.clone();
        let mut used_fallback = false;
        let mut last_error =
            ProxyError::NoAccounts { provider: Provider::Antigravity.to_string() };

        let mut attempt = 0;
        while attempt < self.max_attempts() {
            let account = match acquire_account(
                &self.pool,
                Provider::Antigravity,
                &model,
                self.fallback_enabled,
                used_fallback,
            )
            .await?
            {
                AcquireOutcome::Account(a) => a,
                AcquireOutcome::Fallback(m) => {
                    used_fallback = true;
                    model = m;
                    continue;
                }
            };

            let (token, body) = match self.prepare(req, &model, &account).await? {
                AttemptOutcome::Done(prepared) => prepared,
                AttemptOutcome::Rotate(e) => {
                    last_error = e;
                    attempt += 1;
                    continue;
                }
                AttemptOutcome::RotateAfterDelay(e) => {
                    last_error = e;
                    tokio::time::sleep(std::time::Duration::from_millis(NETWORK_RETRY_DELAY_MS))
                        .await;
                    attempt += 1;
                    continue;
                }
            };

            let headers = Self::extra_headers(req, &model);
            let outcome = self.client.generate_content(&token, &body, &headers).await;
            let response = match self.classify_failure(outcome, &account.email, &model)? {
                AttemptOutcome::Done(r) => r,
                AttemptOutcome::Rotate(e) => {
                    last_error = e;
                    attempt += 1;
                    continue;
                }
                AttemptOutcome::RotateAfterDelay(e) => {
                    last_error = e;
                    tokio::time::sleep(std::time::Duration::from_millis(NETWORK_RETRY_DELAY_MS))
                        .await;
                    attempt += 1;
                    continue;
                }
            };

            let raw: Value = response.json().await.map_err(|e| ProxyError::Upstream {
                status: 502,
                body: format!("unparsable upstream response: {}", e),
            })?;
            let unwrapped = raw.get("response").unwrap_or(&raw);
            let gemini: GeminiResponse =
                serde_json::from_value(unwrapped.clone()).map_err(|e| ProxyError::Upstream {
                    status: 502,
                    body: format!("unexpected upstream shape: {}", e),
                })?;

            let mut claude = transform_response(&gemini, &model)?;
            claude.model = req.model.clone();
            tracing::info!(
                "Request finished | account {} | model {} | in {} out {}",
                account.email,
                model,
                claude.usage.input_tokens,
                claude.usage.output_tokens
            );
            return Ok(claude);
        }

        Err(last_error)
    }

    async fn send_stream(&self, req: &ClaudeRequest) -> Result<mpsc::Receiver<Bytes>, ProxyError> {
        let mut model = req.model.clone();
        let mut used_fallback = false;
        let mut last_error =
            ProxyError::NoAccounts { provider: Provider::Antigravity.to_string() };

        let mut attempt = 0;
        'attempts: while attempt < self.max_attempts() {
            let account = match acquire_account(
                &self.pool,
                Provider::Antigravity,
                &model,
                self.fallback_enabled,
                used_fallback,
            )
            .await?
            {
                AcquireOutcome::Account(a) => a,
                AcquireOutcome::Fallback(m) => {
                    used_fallback = true;
                    model = m;
                    continue;
                }
            };

            let (token, body) = match self.prepare(req, &model, &account).await? {
                AttemptOutcome::Done(prepared) => prepared,
                AttemptOutcome::Rotate(e) => {
                    last_error = e;
                    attempt += 1;
                    continue;
                }
                AttemptOutcome::RotateAfterDelay(e) => {
                    last_error = e;
                    tokio::time::sleep(std::time::Duration::from_millis(NETWORK_RETRY_DELAY_MS))
                        .await;
                    attempt += 1;
                    continue;
                }
            };

            let headers = Self::extra_headers(req, &model);
            let outcome = self.client.stream_generate_content(&token, &body, &headers).await;
            let response = match self.classify_failure(outcome, &account.email, &model)? {
                AttemptOutcome::Done(r) => r,
                AttemptOutcome::Rotate(e) => {
                    last_error = e;
                    attempt += 1;
                    continue;
                }
                AttemptOutcome::RotateAfterDelay(e) => {
                    last_error = e;
                    tokio::time::sleep(std::time::Duration::from_millis(NETWORK_RETRY_DELAY_MS))
                        .await;
                    attempt += 1;
                    continue;
                }
            };

            match probe_sse(response, StreamingState::new(&model)).await {
                Ok(ProbeOutcome::Content(probed)) => return Ok(probed.into_receiver()),
                Ok(ProbeOutcome::Empty) => {
                    // Same-endpoint recovery: the response opened cleanly but
                    // carried no parts. Refetch with exponential backoff.
                    let mut empty_retry = 0u32;
                    let mut extra_5xx = 0u32;
                    while empty_retry < MAX_EMPTY_RESPONSE_RETRIES {
                        let delay = EMPTY_RETRY_BASE_DELAY_MS * (1u64 << empty_retry);
                        tracing::warn!(
                            "Empty response from upstream (retry {} in {}ms)",
                            empty_retry + 1,
                            delay
                        );
                        tokio::time::sleep(std::time::Duration::from_millis(delay)).await;

                        let retry_outcome =
                            self.client.stream_generate_content(&token, &body, &headers).await;
                        match self.classify_failure(retry_outcome, &account.email, &model)? {
                            AttemptOutcome::Done(retry_response) => {
                                match probe_sse(retry_response, StreamingState::new(&model)).await
                                {
                                    Ok(ProbeOutcome::Content(probed)) => {
                                        return Ok(probed.into_receiver())
                                    }
                                    Ok(ProbeOutcome::Empty) => {
                                        empty_retry += 1;
                                    }
                                    Err(e) => {
                                        last_error = e;
                                        attempt += 1;
                                        continue 'attempts;
                                    }
                                }
                            }
                            // Rate limit or auth failure on the refetch
                            // breaks out to the account-rotation loop.
                            AttemptOutcome::Rotate(e) => {
                                last_error = e;
                                attempt += 1;
                                continue 'attempts;
                            }
                            // A 5xx does not consume an empty-retry credit.
                            AttemptOutcome::RotateAfterDelay(e) => {
                                extra_5xx += 1;
                                if extra_5xx > MAX_EMPTY_RETRY_5XX {
                                    last_error = e;
                                    attempt += 1;
                                    continue 'attempts;
                                }
                            }
                        }
                    }

                    tracing::error!(
                        "Upstream produced only empty responses after {} retries; sending fallback",
                        MAX_EMPTY_RESPONSE_RETRIES
                    );
                    return Ok(canned_events(empty_response_fallback_events(&model)));
                }
                Err(e) => {
                    last_error = e;
                    attempt += 1;
                    continue;
                }
            }
        }

        Err(last_error)
    }

    async fn get_status(&self) -> Value {
        let accounts = self.pool.list_accounts();
        let now = chrono::Utc::now().timestamp_millis();
        let entries: Vec<Value> = accounts
            .iter()
            .filter(|a| a.provider == Provider::Antigravity)
            .map(|a| {
                let limited_models: Vec<&String> = a
                    .model_rate_limits
                    .iter()
                    .filter(|(_, l)| l.is_active(now))
                    .map(|(m, _)| m)
                    .collect();
                json!({
                    "email": a.email,
                    "invalid": a.is_invalid,
                    "rate_limited_models": limited_models,
                })
            })
            .collect();
        json!({ "provider": "antigravity", "accounts": entries })
    }

    async fn generate_image(&self, req: &Value) -> Result<Value, ProxyError> {
        let prompt = req
            .get("prompt")
            .and_then(|p| p.as_str())
            .ok_or_else(|| ProxyError::InvalidRequest { message: "prompt is required".into() })?;
        let model = req
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or("gemini-2.5-flash-image")
            .to_string();

        let account = match acquire_account(&self.pool, Provider::Antigravity, &model, false, true)
            .await?
        {
            AcquireOutcome::Account(a) => a,
            AcquireOutcome::Fallback(_) => unreachable!("fallback disabled for images"),
        };
        let token = self.pool.get_token(&account).await?;
        let project = self.pool.get_project(&account, &token).await?;

        let body = json!({
            "project": project,
            "requestId": format!("agent-{}", uuid::Uuid::new_v4()),
            "request": {
                "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
                "generationConfig": { "responseModalities": ["IMAGE"] },
            },
            "model": model,
            "userAgent": "antigravity",
            "requestType": "image",
        });

        let outcome =
            self.client.generate_content(&token, &body, &HashMap::new()).await;
        let response = match self.classify_failure(outcome, &account.email, &model)? {
            AttemptOutcome::Done(r) => r,
            AttemptOutcome::Rotate(e) | AttemptOutcome::RotateAfterDelay(e) => return Err(e),
        };

        let raw: Value = response.json().await.map_err(|e| ProxyError::Upstream {
            status: 502,
            body: format!("unparsable image response: {}", e),
        })?;
        let unwrapped = raw.get("response").unwrap_or(&raw);

        let images: Vec<Value> = unwrapped
            .pointer("/candidates/0/content/parts")
            .and_then(|p| p.as_array())
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|part| part.pointer("/inlineData/data").and_then(|d| d.as_str()))
                    .map(|data| json!({ "b64_json": data }))
                    .collect()
            })
            .unwrap_or_default();

        if images.is_empty() {
            return Err(ProxyError::EmptyResponse);
        }
        Ok(json!({ "created": chrono::Utc::now().timestamp(), "data": images }))
    }
}

/// Shared constructor used by the server bootstrap.
pub fn new_dispatch(
    pool: SharedPool,
    http: reqwest::Client,
    fallback_enabled: bool,
) -> Arc<dyn ProviderDispatch> {
    Arc::new(AntigravityDispatch::new(pool, http, fallback_enabled))
}
