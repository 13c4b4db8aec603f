//! Per-provider dispatch engines behind a common capability surface.

pub mod antigravity;
pub mod copilot;
pub mod zai;

mod acquire;

pub use acquire::{acquire_account, AcquireOutcome};

use async_trait::async_trait;
use bytes::Bytes;
use multiclaude_types::protocol::claude::{ClaudeRequest, ClaudeResponse};
use multiclaude_types::{Provider, ProxyError};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Maximum dispatch attempts, raised to account count + 1 when the pool is
/// larger.
pub const MAX_RETRIES: usize = 3;

/// Extra wait on top of the computed rate-limit reset.
pub const POST_RATE_LIMIT_BUFFER_MS: i64 = 1_000;

/// Longest the dispatch will sleep waiting for a rate-limit reset before
/// surfacing RESOURCE_EXHAUSTED.
pub const MAX_WAIT_BEFORE_ERROR_MS: i64 = 120_000;

/// Pause after a transport-level failure before the next attempt.
pub const NETWORK_RETRY_DELAY_MS: u64 = 1_000;

/// Same-endpoint refetches permitted for an empty streaming response.
pub const MAX_EMPTY_RESPONSE_RETRIES: u32 = 2;

/// Base backoff for empty-response refetches (doubles per retry).
pub const EMPTY_RETRY_BASE_DELAY_MS: u64 = 500;

/// One-hop model fallback used when a pool is exhausted for the requested
/// model.
pub fn fallback_model(model: &str) -> Option<&'static str> {
    match model {
        "claude-opus-4-5" => Some("claude-sonnet-4-5"),
        "claude-sonnet-4-5" => Some("gemini-3-pro-preview"),
        "gemini-3-pro-preview" => Some("gemini-2.5-pro"),
        "glm-4.6" => Some("glm-4.5-air"),
        _ => None,
    }
}

/// Capability surface each backend implements.
#[async_trait]
pub trait ProviderDispatch: Send + Sync {
    /// Which provider's accounts this dispatch consumes.
    fn provider(&self) -> Provider;

    /// Whether the model id is routed to this backend.
    fn supports_model(&self, model: &str) -> bool;

    /// Model entries for `/v1/models`, in Anthropic list form.
    async fn list_models(&self) -> Vec<Value>;

    /// Non-streaming completion.
    async fn send_message(&self, req: &ClaudeRequest) -> Result<ClaudeResponse, ProxyError>;

    /// Streaming completion; the receiver yields ready-to-send SSE frames.
    async fn send_stream(&self, req: &ClaudeRequest) -> Result<mpsc::Receiver<Bytes>, ProxyError>;

    /// Health snapshot for `/health`. Read-only: must not persist state.
    async fn get_status(&self) -> Value;

    /// Image generation, where the backend supports it.
    async fn generate_image(&self, _req: &Value) -> Result<Value, ProxyError> {
        Err(ProxyError::InvalidRequest {
            message: format!("{} does not support image generation", self.provider()),
        })
    }
}

/// Routes each request to the provider owning its model.
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn ProviderDispatch>>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<Arc<dyn ProviderDispatch>>) -> Self {
        Self { providers }
    }

    /// Resolve the dispatch owning `model`.
    pub fn route(&self, model: &str) -> Result<Arc<dyn ProviderDispatch>, ProxyError> {
        self.providers
            .iter()
            .find(|p| p.supports_model(model))
            .cloned()
            .ok_or_else(|| ProxyError::UnsupportedModel { model: model.to_string() })
    }

    pub fn all(&self) -> &[Arc<dyn ProviderDispatch>] {
        &self.providers
    }
}

/// Human-readable reset timestamp for RESOURCE_EXHAUSTED errors.
pub(crate) fn format_reset_time(wait_ms: i64) -> String {
    let reset = chrono::Utc::now() + chrono::Duration::milliseconds(wait_ms.max(0));
    reset.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}
