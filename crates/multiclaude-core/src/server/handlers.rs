//! Request handlers for the Anthropic-compatible surface.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use multiclaude_types::protocol::claude::ClaudeRequest;
use multiclaude_types::{Provider, ProxyError};
use serde_json::{json, Value};
use std::convert::Infallible;
use tokio_stream::wrappers::ReceiverStream;

use super::AppState;

fn error_response(err: &ProxyError) -> Response {
    let status = StatusCode::from_u16(err.http_status_code())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(json!({
            "type": "error",
            "error": { "type": err.anthropic_type(), "message": err.to_string() }
        })),
    )
        .into_response()
}

/// `POST /v1/messages` — the main completion endpoint.
pub async fn handle_messages(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Response {
    let request: ClaudeRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => {
            return error_response(&ProxyError::InvalidRequest {
                message: format!("malformed request: {}", e),
            })
        }
    };

    let provider = match state.registry.route(&request.model) {
        Ok(p) => p,
        Err(e) => return error_response(&e),
    };
    tracing::debug!(
        "Routing model {} to {} (stream: {})",
        request.model,
        provider.provider(),
        request.stream
    );

    if request.stream {
        match provider.send_stream(&request).await {
            Ok(rx) => {
                let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
                Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, "text/event-stream")
                    .header(header::CACHE_CONTROL, "no-cache")
                    .body(Body::from_stream(stream))
                    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
            }
            Err(e) => error_response(&e),
        }
    } else {
        let budget = std::time::Duration::from_secs(state.config.write_timeout_sec);
        match tokio::time::timeout(budget, provider.send_message(&request)).await {
            Ok(Ok(response)) => (StatusCode::OK, Json(response)).into_response(),
            Ok(Err(e)) => error_response(&e),
            Err(_) => error_response(&ProxyError::Internal {
                message: format!("request exceeded {}s budget", budget.as_secs()),
            }),
        }
    }
}

/// `GET /v1/models` — aggregate model list across providers.
pub async fn handle_list_models(State(state): State<AppState>) -> Response {
    let mut data = Vec::new();
    for provider in state.registry.all() {
        data.extend(provider.list_models().await);
    }
    Json(json!({ "data": data, "has_more": false })).into_response()
}

/// `POST /v1/images/generations` — Antigravity only.
pub async fn handle_image_generations(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Response {
    let provider = state
        .registry
        .all()
        .iter()
        .find(|p| p.provider() == Provider::Antigravity)
        .cloned();

    match provider {
        Some(dispatch) => match dispatch.generate_image(&body).await {
            Ok(result) => Json(result).into_response(),
            Err(e) => error_response(&e),
        },
        None => error_response(&ProxyError::NoAccounts {
            provider: Provider::Antigravity.to_string(),
        }),
    }
}

/// `GET /health` — pool status snapshot. Read-only: the quota refreshes
/// behind this never persist.
pub async fn handle_health(State(state): State<AppState>) -> Response {
    let mut providers = Vec::new();
    for provider in state.registry.all() {
        providers.push(provider.get_status().await);
    }

    let accounts = state.pool.list_accounts();
    let now = chrono::Utc::now().timestamp_millis();
    let available = accounts
        .iter()
        .filter(|a| !a.is_invalid)
        .filter(|a| !a.model_rate_limits.values().all(|l| l.is_active(now)) || a.model_rate_limits.is_empty())
        .count();

    Json(json!({
        "status": if available > 0 { "ok" } else { "degraded" },
        "accounts_total": accounts.len(),
        "accounts_available": available,
        "providers": providers,
    }))
    .into_response()
}
