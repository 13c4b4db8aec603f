//! GitHub device-code enrollment and the Copilot token exchange.

use multiclaude_types::ProxyError;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;

const GITHUB_CLIENT_ID: &str = "Iv1.b507a08c87ecfe98";
const DEVICE_CODE_URL: &str = "https://github.com/login/device/code";
const ACCESS_TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
const COPILOT_TOKEN_URL: &str = "https://api.github.com/copilot_internal/v2/token";

/// Exchange tokens are considered stale this long before their advertised
/// expiry.
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCodeResponse {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default)]
    pub expires_in: u64,
}

fn default_interval() -> u64 {
    5
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CopilotToken {
    pub token: String,
    pub expires_at: i64,
}

/// Begin the device-code flow. The caller shows `user_code` and
/// `verification_uri` to the operator.
pub async fn request_device_code(http: &reqwest::Client) -> Result<DeviceCodeResponse, ProxyError> {
    http.post(DEVICE_CODE_URL)
        .header("Accept", "application/json")
        .form(&[("client_id", GITHUB_CLIENT_ID), ("scope", "read:user")])
        .send()
        .await
        .map_err(|e| ProxyError::Network { message: e.to_string() })?
        .json::<DeviceCodeResponse>()
        .await
        .map_err(|e| ProxyError::Network { message: format!("device code parse error: {}", e) })
}

/// Poll until the operator approves the device, the code expires, or GitHub
/// reports a terminal error. Returns the long-lived GitHub token.
pub async fn poll_for_access_token(
    http: &reqwest::Client,
    device: &DeviceCodeResponse,
) -> Result<String, ProxyError> {
    let deadline = chrono::Utc::now().timestamp() + device.expires_in.max(300) as i64;

    loop {
        tokio::time::sleep(std::time::Duration::from_secs(device.interval.max(5))).await;
        if chrono::Utc::now().timestamp() > deadline {
            return Err(ProxyError::AuthInvalid {
                email: String::new(),
                message: "device code expired before approval".to_string(),
            });
        }

        let response = http
            .post(ACCESS_TOKEN_URL)
            .header("Accept", "application/json")
            .form(&[
                ("client_id", GITHUB_CLIENT_ID),
                ("device_code", device.device_code.as_str()),
                ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
            ])
            .send()
            .await
            .map_err(|e| ProxyError::Network { message: e.to_string() })?
            .json::<AccessTokenResponse>()
            .await
            .map_err(|e| ProxyError::Network { message: e.to_string() })?;

        if let Some(token) = response.access_token {
            return Ok(token);
        }
        match response.error.as_deref() {
            Some("authorization_pending") | Some("slow_down") => continue,
            Some(other) => {
                return Err(ProxyError::AuthInvalid {
                    email: String::new(),
                    message: format!("device flow failed: {}", other),
                })
            }
            None => continue,
        }
    }
}

/// Per-account cache of exchanged Copilot tokens under its own lock.
pub struct CopilotTokenCache {
    tokens: Mutex<HashMap<String, CopilotToken>>,
}

impl CopilotTokenCache {
    pub fn new() -> Self {
        Self { tokens: Mutex::new(HashMap::new()) }
    }

    /// A short-lived Copilot API token for the account, exchanging the
    /// GitHub token when the cached one is near expiry.
    pub async fn get(
        &self,
        http: &reqwest::Client,
        email: &str,
        github_token: &str,
    ) -> Result<String, ProxyError> {
        let now = chrono::Utc::now().timestamp();
        {
            let tokens = self.tokens.lock();
            if let Some(cached) = tokens.get(email) {
                if now < cached.expires_at - EXPIRY_MARGIN_SECS {
                    return Ok(cached.token.clone());
                }
            }
        }

        tracing::debug!("Exchanging Copilot token for {}", email);
        let response = http
            .get(COPILOT_TOKEN_URL)
            .header("Authorization", format!("token {}", github_token))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| ProxyError::AuthNetwork { email: email.to_string(), message: e.to_string() })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.is_client_error() {
                return Err(ProxyError::AuthInvalid {
                    email: email.to_string(),
                    message: format!("token exchange rejected ({}): {}", status, body),
                });
            }
            return Err(ProxyError::AuthNetwork {
                email: email.to_string(),
                message: format!("token exchange returned {}", status),
            });
        }

        let token: CopilotToken = response.json().await.map_err(|e| ProxyError::AuthNetwork {
            email: email.to_string(),
            message: format!("token exchange parse error: {}", e),
        })?;

        self.tokens.lock().insert(email.to_string(), token.clone());
        Ok(token.token)
    }

    /// Drop a cached token (after an upstream 401).
    pub fn invalidate(&self, email: &str) {
        self.tokens.lock().remove(email);
    }
}

impl Default for CopilotTokenCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cached_token_expires_with_margin() {
        let cache = CopilotTokenCache::new();
        let now = chrono::Utc::now().timestamp();
        cache.tokens.lock().insert(
            "a@b.c".to_string(),
            CopilotToken { token: "tok".into(), expires_at: now + 30 },
        );
        // 30s left is inside the 60s margin: the sync fast path must miss.
        let tokens = cache.tokens.lock();
        let cached = tokens.get("a@b.c").unwrap();
        assert!(now >= cached.expires_at - EXPIRY_MARGIN_SECS);
    }
}
