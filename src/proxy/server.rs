use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tracing::info;

use crate::models::AppConfig;
use crate::modules::persistence::AccountStore;
use crate::proxy::concurrency::{ConcurrencyArbiter, InMemorySlotStore};
use crate::proxy::cooldown::{ChallengeCooldownRegistry, SidecarSessionRegistry};
use crate::proxy::forwarder::UpstreamForwarder;
use crate::proxy::handlers;
use crate::proxy::identity::IdentityStore;
use crate::proxy::middleware::auth::auth_middleware;
use crate::proxy::passthrough::ErrorPassthrough;
use crate::proxy::selection::AccountSelector;
use crate::proxy::state::AppState;
use crate::proxy::token::TokenManager;
use crate::proxy::upstream::UpstreamClient;
use crate::proxy::usage::LogUsageRecorder;

// Wires the full service graph behind one AppState.
pub fn build_state(config: Arc<AppConfig>, data_dir: &Path) -> Result<AppState, String> {
    let accounts = Arc::new(AccountStore::new(data_dir)?);
    let upstream = Arc::new(UpstreamClient::new());
    let identity = Arc::new(IdentityStore::new());
    let cooldowns = Arc::new(ChallengeCooldownRegistry::new());
    let sidecar_sessions = Arc::new(SidecarSessionRegistry::new());
    let arbiter = Arc::new(ConcurrencyArbiter::new(
        Arc::new(InMemorySlotStore::new()),
        Duration::from_secs(config.concurrency.ping_interval.max(1)),
    ));
    let tokens = Arc::new(TokenManager::new(
        upstream.clone(),
        accounts.clone(),
        None,
        config.sora.client.use_openai_token_provider,
    ));
    let selector = Arc::new(AccountSelector::new(
        accounts.clone(),
        arbiter.clone(),
        cooldowns.clone(),
        Duration::from_secs(config.concurrency.account_wait_timeout_seconds),
    ));
    let forwarder = Arc::new(UpstreamForwarder::new(
        config.clone(),
        upstream,
        identity,
        tokens,
        cooldowns,
        sidecar_sessions,
    ));
    let passthrough = Arc::new(ErrorPassthrough::new(config.error_passthrough.clone()));

    Ok(AppState {
        config,
        accounts,
        arbiter,
        selector,
        forwarder,
        passthrough,
        usage: Arc::new(LogUsageRecorder),
    })
}

pub fn build_router(state: AppState) -> Router {
    // Keep the framework cap above the gateway's own so the 413 always
    // carries the gateway error shape.
    let framework_cap = state.config.proxy.request_body_max_bytes.saturating_add(4096);
    Router::new()
        .route("/openai/v1/responses", post(handlers::openai::responses))
        .route("/healthz", get(healthz))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(DefaultBodyLimit::max(framework_cap))
        .with_state(state)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn serve(state: AppState) -> Result<(), String> {
    let bind_host = if state.config.proxy.allow_lan_access {
        "0.0.0.0"
    } else {
        "127.0.0.1"
    };
    let addr = format!("{}:{}", bind_host, state.config.proxy.port);
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("failed_to_bind {}: {}", addr, e))?;
    info!("Gateway listening on {}", addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down gateway");
        })
        .await
        .map_err(|e| format!("server_error: {}", e))
}
