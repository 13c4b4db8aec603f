//! Z.AI dispatch: Anthropic-compatible passthrough with quota-driven soft
//! limits.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use multiclaude_types::protocol::claude::{ClaudeRequest, ClaudeResponse};
use multiclaude_types::{Account, Provider, ProxyError};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::{acquire_account, AcquireOutcome, ProviderDispatch, MAX_RETRIES, NETWORK_RETRY_DELAY_MS};
use crate::pool::SharedPool;

const ZAI_API_BASE: &str = "https://api.z.ai/api/anthropic";
const ZAI_QUOTA_URL: &str = "https://api.z.ai/api/biz/subscription/quota/limit";

/// Models advertised when the upstream listing is unreachable.
const STATIC_MODELS: [&str; 3] = ["glm-4.6", "glm-4.5", "glm-4.5-air"];

pub struct ZaiDispatch {
    pool: SharedPool,
    http: reqwest::Client,
    fallback_enabled: bool,
}

impl ZaiDispatch {
    pub fn new(pool: SharedPool, http: reqwest::Client, fallback_enabled: bool) -> Self {
        Self { pool, http, fallback_enabled }
    }

    fn max_attempts(&self) -> usize {
        MAX_RETRIES.max(self.pool.account_count(Provider::Zai) + 1)
    }

    async fn call_messages(
        &self,
        api_key: &str,
        body: &Value,
    ) -> Result<reqwest::Response, ProxyError> {
        self.http
            .post(format!("{}/v1/messages", ZAI_API_BASE))
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .json(body)
            .send()
            .await
            .map_err(|e| ProxyError::Network { message: e.to_string() })
    }

    /// Refresh the account's observed quota and feed it into the soft-limit
    /// bookkeeping. The read-only health path passes `persist = false`.
    pub async fn refresh_quota(&self, account: &Account, persist: bool) {
        let Some(api_key) = &account.api_key else { return };

        let response = match self
            .http
            .get(ZAI_QUOTA_URL)
            .header("x-api-key", api_key.as_str())
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!("Quota refresh failed for {}: {}", account.email, e);
                return;
            }
        };
        if !response.status().is_success() {
            return;
        }
        let Ok(data) = response.json::<Value>().await else { return };

        // The quota feed carries a TOKENS_LIMIT entry only once tokens have
        // been consumed; its absence means a full allowance.
        let tokens_entry = data
            .pointer("/data/limits")
            .or_else(|| data.get("limits"))
            .and_then(|l| l.as_array())
            .and_then(|limits| {
                limits
                    .iter()
                    .find(|e| e.get("type").and_then(|t| t.as_str()) == Some("TOKENS_LIMIT"))
            })
            .cloned();

        let (remaining, reset_ms) = match &tokens_entry {
            Some(entry) => {
                let used_pct = entry
                    .get("percentage")
                    .and_then(|p| p.as_f64())
                    .unwrap_or(0.0);
                let reset = entry.get("nextResetTime").and_then(|r| r.as_i64()).unwrap_or(0);
                (1.0 - used_pct / 100.0, reset)
            }
            None => (1.0, 0),
        };

        for model in STATIC_MODELS {
            self.pool.update_soft_limit(&account.email, model, remaining, persist);
            // Hard-limit marking persists; only the dispatch path may do it.
            if persist && remaining <= 0.0 && reset_ms > 0 {
                self.pool.mark_rate_limited(&account.email, reset_ms, model);
            }
        }
    }
}

#[async_trait]
impl ProviderDispatch for ZaiDispatch {
    fn provider(&self) -> Provider {
        Provider::Zai
    }

    fn supports_model(&self, model: &str) -> bool {
        model.starts_with("glm")
    }

    async fn list_models(&self) -> Vec<Value> {
        if let Some(account) = self.pool.pick_next(Provider::Zai, "") {
            if let Some(api_key) = &account.api_key {
                let listed = self
                    .http
                    .get(format!("{}/v1/models", ZAI_API_BASE))
                    .header("x-api-key", api_key.as_str())
                    .send()
                    .await;
                if let Ok(resp) = listed {
                    if let Ok(parsed) = resp.json::<Value>().await {
                        if let Some(models) = parsed.get("data").and_then(|d| d.as_array()) {
                            return models
                                .iter()
                                .filter_map(|m| m.get("id").and_then(|v| v.as_str()))
                                .map(|id| {
                                    json!({ "id": id, "type": "model", "display_name": id })
                                })
                                .collect();
                        }
                    }
                }
            }
        }
        STATIC_MODELS
            .iter()
            .map(|id| json!({ "id": id, "type": "model", "display_name": id }))
            .collect()
    }

    async fn send_message(&self, req: &ClaudeRequest) -> Result<ClaudeResponse, ProxyError> {
        let body = serde_json::to_value(req)
            .map_err(|e| ProxyError::Internal { message: e.to_string() })?;
        let mut last_error = ProxyError::NoAccounts { provider: Provider::Zai.to_string() };

        let mut attempt = 0;
        while attempt < self.max_attempts() {
            let account = match acquire_account(
                &self.pool,
                Provider::Zai,
                &req.model,
                self.fallback_enabled,
                false,
            )
            .await?
            {
                AcquireOutcome::Account(a) => a,
                AcquireOutcome::Fallback(_) => {
                    // Z.AI fallback hops stay inside the glm family and the
                    // passthrough body already names the model; skip.
                    attempt += 1;
                    continue;
                }
            };
            let api_key = self.pool.get_token(&account).await?;

            let response = match self.call_messages(&api_key, &body).await {
                Ok(r) => r,
                Err(e) => {
                    last_error = e;
                    tokio::time::sleep(std::time::Duration::from_millis(NETWORK_RETRY_DELAY_MS))
                        .await;
                    attempt += 1;
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                self.refresh_quota(&account, true).await;
                return response
                    .json::<ClaudeResponse>()
                    .await
                    .map_err(|e| ProxyError::Upstream {
                        status: 502,
                        body: format!("unparsable z.ai response: {}", e),
                    });
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
                    self.pool.mark_rate_limited(&account.email, reset, &req.model);
                    last_error = ProxyError::RateLimited {
                        provider: Provider::Zai.to_string(),
                        reset_ms: retry_after.map(|s| s * 1000),
                    };
                    attempt += 1;
                }
                401 | 403 => {
                    // An API key cannot be refreshed; the account is out
                    // until re-enrolled.
                    self.pool
                        .mark_invalid(&account.email, &format!("z.ai rejected key: {}", status));
                    last_error = ProxyError::AuthInvalid {
                        email: account.email.clone(),
                        message: body_text,
                    };
                    attempt += 1;
                }
                500..=599 => {
                    last_error = ProxyError::Upstream { status: status.as_u16(), body: body_text };
                    attempt += 1;
                }
                _ => return Err(ProxyError::Upstream { status: status.as_u16(), body: body_text }),
            }
        }

        Err(last_error)
    }

    async fn send_stream(&self, req: &ClaudeRequest) -> Result<mpsc::Receiver<Bytes>, ProxyError> {
        let mut body = serde_json::to_value(req)
            .map_err(|e| ProxyError::Internal { message: e.to_string() })?;
        body["stream"] = json!(true);
        let mut last_error = ProxyError::NoAccounts { provider: Provider::Zai.to_string() };

        let mut attempt = 0;
        while attempt < self.max_attempts() {
            let account = match acquire_account(
                &self.pool,
                Provider::Zai,
                &req.model,
                false,
                true,
            )
            .await?
            {
                AcquireOutcome::Account(a) => a,
                AcquireOutcome::Fallback(_) => unreachable!("fallback disabled"),
            };
            let api_key = self.pool.get_token(&account).await?;

            let response = match self.call_messages(&api_key, &body).await {
                Ok(r) => r,
                Err(e) => {
                    last_error = e;
                    tokio::time::sleep(std::time::Duration::from_millis(NETWORK_RETRY_DELAY_MS))
                        .await;
                    attempt += 1;
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
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
                        self.pool.mark_rate_limited(&account.email, reset, &req.model);
                        last_error = ProxyError::RateLimited {
                            provider: Provider::Zai.to_string(),
                            reset_ms: retry_after.map(|s| s * 1000),
                        };
                        attempt += 1;
                        continue;
                    }
                    401 | 403 => {
                        self.pool.mark_invalid(
                            &account.email,
                            &format!("z.ai rejected key: {}", status),
                        );
                        last_error = ProxyError::AuthInvalid {
                            email: account.email.clone(),
                            message: body_text,
                        };
                        attempt += 1;
                        continue;
                    }
                    500..=599 => {
                        last_error =
                            ProxyError::Upstream { status: status.as_u16(), body: body_text };
                        attempt += 1;
                        continue;
                    }
                    _ => {
                        return Err(ProxyError::Upstream {
                            status: status.as_u16(),
                            body: body_text,
                        })
                    }
                }
            }

            // Anthropic-native SSE: forward the bytes untouched. The pump
            // stops (and closes the upstream reader) when the client goes
            // away.
            let (tx, rx) = mpsc::channel::<Bytes>(64);
            tokio::spawn(async move {
                let mut stream = response.bytes_stream();
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(bytes) => {
                            if tx.send(bytes).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            tracing::warn!("z.ai stream error: {}", e);
                            return;
                        }
                    }
                }
            });
            return Ok(rx);
        }

        Err(last_error)
    }

    async fn get_status(&self) -> Value {
        let accounts = self.pool.list_accounts();
        // Read-only refresh: update in-memory soft limits without touching
        // the store.
        for account in accounts.iter().filter(|a| a.provider == Provider::Zai) {
            self.refresh_quota(account, false).await;
        }
        let now = chrono::Utc::now().timestamp_millis();
        let entries: Vec<Value> = self
            .pool
            .list_accounts()
            .iter()
            .filter(|a| a.provider == Provider::Zai)
            .map(|a| {
                json!({
                    "email": a.email,
                    "invalid": a.is_invalid,
                    "soft_limited": a.model_rate_limits.values().any(|l| l.is_soft_limited),
                    "rate_limited": a.model_rate_limits.values().any(|l| l.is_active(now)),
                })
            })
            .collect();
        json!({ "provider": "zai", "accounts": entries })
    }
}
