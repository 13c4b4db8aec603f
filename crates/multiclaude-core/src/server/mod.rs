//! Anthropic-compatible HTTP surface.

mod auth;
mod handlers;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ProxyConfig;
use crate::pool::SharedPool;
use crate::providers::ProviderRegistry;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub pool: SharedPool,
    pub registry: Arc<ProviderRegistry>,
    pub config: Arc<ProxyConfig>,
}

/// Build the axum application.
pub fn build_router(state: AppState) -> Router {
    let cors = if state.config.cors_origins.is_empty() {
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
    } else {
        let origins: Vec<_> = state
            .config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Router::new()
        .route("/v1/messages", post(handlers::handle_messages))
        .route("/v1/models", get(handlers::handle_list_models))
        .route("/v1/images/generations", post(handlers::handle_image_generations))
        .layer(axum::middleware::from_fn_with_state(state.clone(), auth::require_api_key))
        .route("/health", get(handlers::handle_health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until shutdown.
pub async fn run(state: AppState) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = format!("{}:{}", state.config.bind_address, state.config.port);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Proxy listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;
    Ok(())
}
