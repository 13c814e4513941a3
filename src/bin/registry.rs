//! capmesh registry binary.
//!
//! Starts the axum HTTP server that coordinates the mesh: agents
//! register here, heartbeat here, and receive provider resolutions for
//! their declared requirements.
//!
//! # Environment Variables
//!
//! - `HOST` — Bind address (default: 0.0.0.0)
//! - `PORT` — HTTP port (default: 8000)
//! - `CAPMESH_HEALTHY_WINDOW_SECS` — Heartbeat age before degraded (default: 60)
//! - `CAPMESH_EVICTION_WINDOW_SECS` — Heartbeat age before eviction (default: 120)
//! - `CAPMESH_SWEEP_INTERVAL_SECS` — Background sweep period, 0 disables (default: 30)
//! - `CAPMESH_SNAPSHOT_PATH` — SQLite snapshot file; unset runs in-memory only
//! - `RUST_LOG` — Tracing filter (default: "info,capmesh=debug")
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin registry
//! # durable state:
//! CAPMESH_SNAPSHOT_PATH=/var/lib/capmesh/registry.db cargo run --bin registry
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use capmesh::clock::SystemClock;
use capmesh::config::MeshConfig;
use capmesh::registry::service::RegistryService;
use capmesh::server::{app_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,capmesh=debug".into()),
        )
        .init();

    let config = MeshConfig::from_env().context("invalid configuration")?;
    let registry = Arc::new(
        RegistryService::from_config(&config, Arc::new(SystemClock))
            .context("failed to open snapshot store")?,
    );

    match registry.restore_from_snapshots() {
        Ok(true) => {
            let snapshot = registry.snapshot();
            tracing::info!(
                "restored {} agents at revision {}",
                snapshot.agents.len(),
                snapshot.revision
            );
        }
        Ok(false) => tracing::info!("starting with an empty store"),
        // A corrupt snapshot must not keep the mesh down; agents
        // re-register on their own schedule.
        Err(err) => tracing::warn!("snapshot restore failed, starting empty: {err}"),
    }

    if config.sweep_interval_secs > 0 {
        let sweeper = Arc::clone(&registry);
        let period = Duration::from_secs(config.sweep_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let evicted = sweeper.sweep_now().await;
                if evicted > 0 {
                    tracing::info!("background sweep evicted {evicted} agents");
                }
            }
        });
    }

    let app = app_router(AppState::new(registry));
    let bind_addr = config.bind_addr().context("invalid bind address")?;

    tracing::info!("capmesh registry starting on {}", bind_addr);
    tracing::info!("Endpoints:");
    tracing::info!("  POST   /register            — agent registration");
    tracing::info!("  POST   /heartbeat           — full heartbeat with deltas");
    tracing::info!("  HEAD   /heartbeat/:agent_id — fast liveness check");
    tracing::info!("  DELETE /agents/:agent_id    — unregister");
    tracing::info!("  GET    /agents /capabilities /health /ready");

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server failed")?;

    tracing::info!("capmesh registry stopped");
    Ok(())
}

/// Resolves when the process receives SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
