//! Antigravity upstream client: ordered endpoint fallback over the Cloud
//! Code v1internal surface.

use multiclaude_types::ProxyError;
use reqwest::{header, Client, Response, StatusCode};
use serde_json::Value;
use std::collections::HashMap;
use tokio::time::Duration;

// v1internal endpoints in fallback order: Sandbox → Daily → Prod. The
// sandbox mirrors see far less 429 pressure than prod.
const V1_INTERNAL_BASE_URL_PROD: &str = "https://cloudcode-pa.googleapis.com/v1internal";
const V1_INTERNAL_BASE_URL_DAILY: &str = "https://daily-cloudcode-pa.googleapis.com/v1internal";
const V1_INTERNAL_BASE_URL_SANDBOX: &str =
    "https://daily-cloudcode-pa.sandbox.googleapis.com/v1internal";

/// User-Agent presented to the Cloud Code surface.
pub const USER_AGENT: &str = "antigravity/1.11.9 (linux; x64)";

const API_CLIENT_HEADER: &str = "gl-node/20.18.0";
const CLIENT_METADATA: &str =
    r#"{"ideType":"ANTIGRAVITY","platform":"LINUX","pluginType":"ANTIGRAVITY"}"#;

/// Beta header attached for Claude thinking models with tools.
pub const INTERLEAVED_THINKING_BETA: &str = "interleaved-thinking-2025-05-14";

const INTER_ENDPOINT_5XX_DELAY_MS: u64 = 250;

/// Ordered base URLs, honoring an operator override.
pub fn base_urls() -> Vec<String> {
    if let Ok(raw) = std::env::var("ANTIGRAVITY_UPSTREAM_URL") {
        let trimmed = raw.trim().trim_end_matches('/').to_string();
        if !trimmed.is_empty() && url::Url::parse(&trimmed).is_ok() {
            return vec![trimmed];
        }
        tracing::warn!("ANTIGRAVITY_UPSTREAM_URL is not a valid URL, using defaults");
    }
    vec![
        V1_INTERNAL_BASE_URL_SANDBOX.to_string(),
        V1_INTERNAL_BASE_URL_DAILY.to_string(),
        V1_INTERNAL_BASE_URL_PROD.to_string(),
    ]
}

/// Outcome of one attempt across the endpoint list.
pub enum UpstreamOutcome {
    /// 2xx response, ready to consume.
    Success(Response),
    /// Every endpoint answered 429; smallest reset seen (unix ms, 0 when
    /// none was advertised).
    RateLimited { min_reset_ms: i64 },
    /// Non-429 4xx, surfaced verbatim.
    Fatal { status: u16, body: String },
    /// Every endpoint failed with 5xx or transport errors.
    Unavailable { message: String },
}

pub struct AntigravityClient {
    http: Client,
    base_urls: Vec<String>,
}

impl AntigravityClient {
    pub fn new(http: Client) -> Self {
        Self { http, base_urls: base_urls() }
    }

    fn build_headers(
        access_token: &str,
        extra_headers: &HashMap<String, String>,
    ) -> Result<header::HeaderMap, ProxyError> {
        let mut headers = header::HeaderMap::new();
        headers
            .insert(header::CONTENT_TYPE, header::HeaderValue::from_static("application/json"));
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&format!("Bearer {}", access_token))
                .map_err(|e| ProxyError::Internal { message: e.to_string() })?,
        );
        headers.insert(header::USER_AGENT, header::HeaderValue::from_static(USER_AGENT));
        headers
            .insert("X-Goog-Api-Client", header::HeaderValue::from_static(API_CLIENT_HEADER));
        headers.insert("Client-Metadata", header::HeaderValue::from_static(CLIENT_METADATA));

        for (k, v) in extra_headers {
            if let (Ok(name), Ok(value)) = (
                header::HeaderName::from_bytes(k.as_bytes()),
                header::HeaderValue::from_str(v),
            ) {
                headers.insert(name, value);
            }
        }
        Ok(headers)
    }

    /// One dispatch attempt: try every endpoint in order.
    ///
    /// 429 keeps the minimum advertised reset across endpoints and moves
    /// on; non-429 4xx stops immediately and is surfaced verbatim; 5xx and
    /// transport errors sleep briefly and try the next endpoint.
    pub async fn call(
        &self,
        method: &str,
        access_token: &str,
        body: &Value,
        query_string: Option<&str>,
        extra_headers: &HashMap<String, String>,
    ) -> UpstreamOutcome {
        let headers = match Self::build_headers(access_token, extra_headers) {
            Ok(h) => h,
            Err(e) => return UpstreamOutcome::Unavailable { message: e.to_string() },
        };

        let mut saw_rate_limit = false;
        let mut min_reset_ms: i64 = 0;
        let mut last_err: Option<String> = None;

        for (idx, base_url) in self.base_urls.iter().enumerate() {
            let url = match query_string {
                Some(qs) => format!("{}:{}?{}", base_url, method, qs),
                None => format!("{}:{}", base_url, method),
            };
            let has_next = idx + 1 < self.base_urls.len();

            let response =
                match self.http.post(&url).headers(headers.clone()).json(body).send().await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!("Transport error at {}: {}", base_url, e);
                        last_err = Some(format!("{}: {}", base_url, e));
                        continue;
                    }
                };

            let status = response.status();
            if status.is_success() {
                if idx > 0 {
                    tracing::info!(
                        "Upstream fallback succeeded | Endpoint {}/{}",
                        idx + 1,
                        self.base_urls.len()
                    );
                }
                return UpstreamOutcome::Success(response);
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                saw_rate_limit = true;
                let reset = extract_reset_ms(&response);
                let body_text = response.text().await.unwrap_or_default();
                let reset = if reset == 0 { parse_reset_from_body(&body_text) } else { reset };
                if reset > 0 && (min_reset_ms == 0 || reset < min_reset_ms) {
                    min_reset_ms = reset;
                }
                tracing::warn!("Endpoint {} returned 429, trying next", base_url);
                continue;
            }

            if status.is_client_error() {
                let body_text = response.text().await.unwrap_or_default();
                return UpstreamOutcome::Fatal { status: status.as_u16(), body: body_text };
            }

            // 5xx: brief pause, then next endpoint.
            let body_text = response.text().await.unwrap_or_default();
            tracing::warn!("Endpoint {} returned {}: {}", base_url, status, body_text);
            last_err = Some(format!("{} returned {}", base_url, status));
            if has_next {
                tokio::time::sleep(Duration::from_millis(INTER_ENDPOINT_5XX_DELAY_MS)).await;
            }
        }

        if saw_rate_limit {
            return UpstreamOutcome::RateLimited { min_reset_ms };
        }
        UpstreamOutcome::Unavailable {
            message: last_err.unwrap_or_else(|| "all endpoints failed".to_string()),
        }
    }

    /// generateContent (non-streaming).
    pub async fn generate_content(
        &self,
        access_token: &str,
        body: &Value,
        extra_headers: &HashMap<String, String>,
    ) -> UpstreamOutcome {
        self.call("generateContent", access_token, body, None, extra_headers).await
    }

    /// streamGenerateContent with SSE framing.
    pub async fn stream_generate_content(
        &self,
        access_token: &str,
        body: &Value,
        extra_headers: &HashMap<String, String>,
    ) -> UpstreamOutcome {
        self.call("streamGenerateContent", access_token, body, Some("alt=sse"), extra_headers)
            .await
    }

    /// fetchAvailableModels.
    pub async fn fetch_available_models(&self, access_token: &str) -> UpstreamOutcome {
        self.call("fetchAvailableModels", access_token, &serde_json::json!({}), None, &HashMap::new())
            .await
    }
}

/// Absolute reset time from a Retry-After header (unix ms; 0 when absent).
fn extract_reset_ms(response: &Response) -> i64 {
    response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<i64>().ok())
        .map(|secs| chrono::Utc::now().timestamp_millis() + secs * 1000)
        .unwrap_or(0)
}

/// Reset time hints embedded in an error body (`quotaResetDelay: "12s"` or
/// a `retryDelay` in RetryInfo details). Returns unix ms; 0 when none.
fn parse_reset_from_body(body: &str) -> i64 {
    let parsed: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) => return 0,
    };

    let delay = parsed
        .pointer("/error/details")
        .and_then(|d| d.as_array())
        .and_then(|details| {
            details
                .iter()
                .find_map(|d| d.get("retryDelay").and_then(|r| r.as_str()).map(|s| s.to_string()))
        })
        .or_else(|| {
            parsed.get("quotaResetDelay").and_then(|r| r.as_str()).map(|s| s.to_string())
        });

    match delay {
        Some(raw) => {
            let secs: f64 = raw.trim_end_matches('s').parse().unwrap_or(0.0);
            if secs > 0.0 {
                chrono::Utc::now().timestamp_millis() + (secs * 1000.0) as i64
            } else {
                0
            }
        }
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_base_urls_prefer_sandbox() {
        let urls = base_urls();
        assert_eq!(urls.len(), 3);
        assert!(urls[0].contains("sandbox"));
        assert!(urls[2].starts_with("https://cloudcode-pa"));
    }

    #[test]
    fn reset_parsed_from_retry_info_details() {
        let body = r#"{"error":{"details":[{"@type":"type.googleapis.com/google.rpc.RetryInfo","retryDelay":"30s"}]}}"#;
        let reset = parse_reset_from_body(body);
        assert!(reset > chrono::Utc::now().timestamp_millis());
    }

    #[test]
    fn reset_zero_for_plain_bodies() {
        assert_eq!(parse_reset_from_body("not json"), 0);
        assert_eq!(parse_reset_from_body("{}"), 0);
    }
}
