//! Access-token acquisition for pool accounts.
//!
//! Manual accounts hand back their API key. OAuth accounts go through a
//! cached Google token refresh; network failures are distinguished from
//! credential failures so a flaky connection never invalidates an account.

use super::{now_ms, AccountPool};
use multiclaude_types::{Account, AccountSource, ProxyError};
use serde::Deserialize;

const OAUTH_TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
const OAUTH_CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
const OAUTH_CLIENT_SECRET: &str = "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";

/// Refresh the cached token once it is older than this.
const TOKEN_REFRESH_INTERVAL_MS: i64 = 5 * 60 * 1000;

/// A cached OAuth access token.
#[derive(Clone, Debug)]
pub struct CachedAccessToken {
    pub token: String,
    pub fetched_at: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[allow(dead_code)]
    #[serde(default)]
    expires_in: i64,
}

impl AccountPool {
    /// Resolve a usable credential for `account`.
    pub async fn get_token(&self, account: &Account) -> Result<String, ProxyError> {
        match account.source {
            AccountSource::Manual => {
                account.api_key.clone().ok_or_else(|| ProxyError::AuthInvalid {
                    email: account.email.clone(),
                    message: "manual account has no api key".to_string(),
                })
            }
            AccountSource::Oauth => self.get_oauth_token(account).await,
        }
    }

    async fn get_oauth_token(&self, account: &Account) -> Result<String, ProxyError> {
        if let Some(cached) = self.access_tokens.get(&account.email) {
            if now_ms() - cached.fetched_at < TOKEN_REFRESH_INTERVAL_MS {
                return Ok(cached.token.clone());
            }
        }

        let refresh_token =
            account.refresh_token.as_deref().ok_or_else(|| ProxyError::AuthInvalid {
                email: account.email.clone(),
                message: "oauth account has no refresh token".to_string(),
            })?;

        tracing::debug!("Refreshing access token for {}", account.email);
        let response = self
            .http
            .post(OAUTH_TOKEN_ENDPOINT)
            .form(&[
                ("client_id", OAUTH_CLIENT_ID),
                ("client_secret", OAUTH_CLIENT_SECRET),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| ProxyError::AuthNetwork {
                email: account.email.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.is_client_error() || body.contains("invalid_grant") {
                let message = format!("token refresh rejected ({}): {}", status, body);
                self.mark_invalid(&account.email, &message);
                return Err(ProxyError::AuthInvalid { email: account.email.clone(), message });
            }
            return Err(ProxyError::AuthNetwork {
                email: account.email.clone(),
                message: format!("token endpoint returned {}", status),
            });
        }

        let token: TokenResponse =
            response.json().await.map_err(|e| ProxyError::AuthNetwork {
                email: account.email.clone(),
                message: format!("token response parse error: {}", e),
            })?;

        self.access_tokens.insert(
            account.email.clone(),
            CachedAccessToken { token: token.access_token.clone(), fetched_at: now_ms() },
        );
        self.clear_invalid(&account.email);
        Ok(token.access_token)
    }
}
