//! HTTP server for the mesh registry protocol.
//!
//! Exposes the registry as the single coordination point agents talk
//! to: registration, heartbeats, discovery listings, and probes.
//!
//! # Endpoints
//!
//! - `POST   /register`             — Register an agent and its tools
//! - `POST   /heartbeat`            — Full heartbeat with resolution deltas
//! - `HEAD   /heartbeat/:agent_id`  — Cheap liveness check
//! - `DELETE /agents/:agent_id`     — Unregister an agent

pub mod routes;

pub use routes::{app_router, AppState};
