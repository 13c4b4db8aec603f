//! Proxy dispatch errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the dispatch core.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "details")]
pub enum ProxyError {
    /// Upstream returned 429; cooldown scheduled for the account.
    #[error("Rate limited by {provider}{}", reset_ms.map(|ms| format!(", reset in {}ms", ms)).unwrap_or_default())]
    RateLimited {
        provider: String,
        reset_ms: Option<i64>,
    },

    /// Credential is invalid or expired; account needs re-enrollment.
    #[error("Authentication failed for {email}: {message}")]
    AuthInvalid { email: String, message: String },

    /// Token refresh failed for network reasons; retry later, do not mark
    /// the account invalid.
    #[error("Auth network error for {email}: {message}")]
    AuthNetwork { email: String, message: String },

    /// No account of the provider can serve the request.
    #[error("No available accounts for {provider}")]
    NoAccounts { provider: String },

    /// Streaming response opened but produced no content parts.
    #[error("Upstream returned an empty response")]
    EmptyResponse,

    /// Every account is rate-limited and the wait exceeds the budget.
    #[error("All accounts rate limited, quota resets at {reset_at}")]
    ResourceExhausted { reset_at: String },

    /// Non-retryable upstream error, surfaced verbatim.
    #[error("Upstream error {status}: {body}")]
    Upstream { status: u16, body: String },

    /// Transport-level failure.
    #[error("Network error: {message}")]
    Network { message: String },

    /// SSE transmission failure mid-stream.
    #[error("Stream error: {message}")]
    Stream { message: String },

    /// Request validation failed.
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// No provider owns the requested model.
    #[error("Unsupported model: {model}")]
    UnsupportedModel { model: String },

    /// Internal proxy error (bugs, unexpected states).
    #[error("Internal proxy error: {message}")]
    Internal { message: String },
}

impl ProxyError {
    /// Whether the dispatch should move to another account and retry.
    pub fn should_rotate_account(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::AuthInvalid { .. }
                | Self::Network { .. }
                | Self::Upstream { status: 500..=599, .. }
        )
    }

    /// Whether the error may clear on its own without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::AuthNetwork { .. }
                | Self::Network { .. }
                | Self::EmptyResponse
                | Self::Upstream { status: 500..=599, .. }
        )
    }

    /// HTTP status code for the server boundary.
    pub fn http_status_code(&self) -> u16 {
        match self {
            Self::RateLimited { .. } | Self::ResourceExhausted { .. } => 429,
            Self::AuthInvalid { .. } => 401,
            Self::AuthNetwork { .. } => 502,
            Self::NoAccounts { .. } => 503,
            Self::EmptyResponse => 502,
            Self::Upstream { status, .. } => *status,
            Self::Network { .. } | Self::Stream { .. } => 502,
            Self::InvalidRequest { .. } => 400,
            Self::UnsupportedModel { .. } => 404,
            Self::Internal { .. } => 500,
        }
    }

    /// Anthropic error `type` string for the response body.
    pub fn anthropic_type(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } | Self::ResourceExhausted { .. } => "rate_limit_error",
            Self::AuthInvalid { .. } => "authentication_error",
            Self::InvalidRequest { .. } => "invalid_request_error",
            Self::UnsupportedModel { .. } => "not_found_error",
            Self::NoAccounts { .. } => "overloaded_error",
            _ => "api_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_codes() {
        assert_eq!(
            ProxyError::ResourceExhausted { reset_at: "2026-01-01T00:00:00Z".to_string() }
                .http_status_code(),
            429
        );
        assert_eq!(
            ProxyError::Upstream { status: 404, body: "nope".to_string() }.http_status_code(),
            404
        );
        assert_eq!(
            ProxyError::InvalidRequest { message: "bad".to_string() }.http_status_code(),
            400
        );
    }

    #[test]
    fn test_should_rotate() {
        let rate_limited =
            ProxyError::RateLimited { provider: "antigravity".to_string(), reset_ms: Some(60_000) };
        let fatal = ProxyError::Upstream { status: 400, body: "bad request".to_string() };

        assert!(rate_limited.should_rotate_account());
        assert!(!fatal.should_rotate_account());
        assert!(!fatal.is_transient());
    }
}
