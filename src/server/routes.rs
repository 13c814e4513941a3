//! Axum route handlers for the registry HTTP server.
//!
//! # Routes
//!
//! - `POST   /register`            — Register an agent, returns full resolutions
//! - `POST   /heartbeat`           — Full heartbeat, returns resolution deltas
//! - `HEAD   /heartbeat/:agent_id` — Fast liveness check (200/202/410)
//! - `DELETE /agents/:agent_id`    — Remove an agent, always 204
//! - `GET    /agents`              — List registered agents with health
//! - `GET    /capabilities`        — List provider tools by capability
//! - `GET    /health`              — Liveness probe
//! - `GET    /ready`               — Readiness probe with durability state

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, head, post},
    Json, Router,
};
use serde_json::Value;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::errors::RegistryError;
use crate::registry::service::RegistryService;
use crate::registry::types::{
    FastHeartbeatStatus, HeartbeatRequest, HeartbeatResponse, RegisterRequest, RegisterResponse,
};

/// Shared application state for the HTTP server.
#[derive(Clone)]
pub struct AppState {
    /// Registry service behind every route.
    pub registry: Arc<RegistryService>,
}

impl AppState {
    pub fn new(registry: Arc<RegistryService>) -> Self {
        Self { registry }
    }
}

/// Build the axum router with all routes.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/register", post(register_handler))
        .route("/heartbeat", post(heartbeat_handler))
        .route("/heartbeat/:agent_id", head(fast_heartbeat_handler))
        .route("/agents/:agent_id", delete(unregister_handler))
        .route("/agents", get(list_agents_handler))
        .route("/capabilities", get(list_capabilities_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// GET /health — liveness probe.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": crate::VERSION,
        "service": "capmesh-registry",
    }))
}

/// GET /ready — readiness probe.
///
/// Always 200 while the process serves; `durability_degraded` flips to
/// true when snapshot writes are failing so operators can alert on it.
async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ready",
        "agents": state.registry.agent_count(),
        "revision": state.registry.revision(),
        "durability_degraded": state.registry.durability_degraded(),
    }))
}

/// POST /register — register an agent with its full tool set.
///
/// Request:  `RegisterRequest` = `{ "agent_id", "endpoint", "transports", "tools", "metadata" }`
/// Response: `RegisterResponse` with resolutions for every declared
/// requirement, `null` where none could be resolved.
async fn register_handler(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, RegistryError> {
    let response = state.registry.register(request).await?;
    Ok(Json(response))
}

/// POST /heartbeat — full heartbeat.
///
/// Returns only the resolution entries that changed since the agent's
/// last contact; a 410 tells an evicted agent to re-register.
async fn heartbeat_handler(
    State(state): State<AppState>,
    Json(request): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, RegistryError> {
    let response = state.registry.heartbeat(request).await?;
    Ok(Json(response))
}

/// HEAD /heartbeat/:agent_id — fast liveness check.
///
/// The whole answer is the status code: 200 nothing changed, 202 a full
/// heartbeat is needed, 410 the agent is unknown and must re-register.
async fn fast_heartbeat_handler(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<StatusCode, RegistryError> {
    let status = state.registry.fast_heartbeat(&agent_id).await?;
    Ok(match status {
        FastHeartbeatStatus::NoChanges => StatusCode::OK,
        FastHeartbeatStatus::TopologyChanged => StatusCode::ACCEPTED,
        FastHeartbeatStatus::AgentUnknown => StatusCode::GONE,
    })
}

/// DELETE /agents/:agent_id — unregister an agent.
///
/// Idempotent: deleting an unknown agent is still 204.
async fn unregister_handler(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<StatusCode, RegistryError> {
    state.registry.unregister(&agent_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /agents — list registered agents and their derived health.
async fn list_agents_handler(State(state): State<AppState>) -> Json<Value> {
    let agents = state.registry.list_agents();
    Json(serde_json::json!({
        "count": agents.len(),
        "agents": agents,
    }))
}

/// GET /capabilities — list provider tools grouped by capability.
async fn list_capabilities_handler(State(state): State<AppState>) -> Json<Value> {
    let capabilities = state.registry.list_capabilities();
    Json(serde_json::json!({
        "count": capabilities.len(),
        "capabilities": capabilities,
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
