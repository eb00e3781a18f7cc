//! Fleet control plane
//!
//! Serves the gatekeeper endpoint for agents and operators, owns the tenant
//! registry and job queue, and reclaims expired job leases in the background.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fleet_control_plane::{
    api::{self, auth::AccessTokens},
    config::{self, StoreBackend},
    db::{Database, MemoryStore, Store, TENANTS},
    provider::MockProvider,
    reaper::LeaseReaper,
    state::AppState,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to FLEET_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fleet control plane");
    info!(
        listen_addr = %config.listen_addr,
        store = ?config.store,
        dev_mode = config.dev_mode,
        "Configuration loaded"
    );

    let store: Arc<dyn Store> = match config.store {
        StoreBackend::Memory => {
            warn!("Using in-memory store; state is lost on restart");
            Arc::new(MemoryStore::new().with_unique_key(TENANTS, "slug"))
        }
        StoreBackend::Postgres => {
            info!(
                pool_size = config.database.pool_size,
                migrate = config.database.migrate_on_start,
                "Opening database"
            );
            let db = match Database::open(&config.database).await {
                Ok(db) => db,
                Err(e) => {
                    error!(error = %e, "Failed to open database");
                    return Err(e.into());
                }
            };
            Arc::new(db.store())
        }
    };

    // No cloud integration ships with the control plane.
    let provider = Arc::new(MockProvider::new());

    let state = AppState::new(
        store,
        provider,
        AccessTokens::new(&config.agent_token, &config.operator_token),
        config.queue.clone(),
        config.deployer.clone(),
    );

    let interrupted = state.deployer().interrupt_stale_rollouts().await?;
    if interrupted > 0 {
        warn!(count = interrupted, "Marked rollouts from a previous run as interrupted");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reaper = LeaseReaper::new(state.jobs().clone(), config.reaper.clone());
    let reaper_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            reaper.run(shutdown_rx).await;
        }
    });

    let app = api::create_router(state.clone());

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    if let Err(e) = tokio::time::timeout(Duration::from_secs(10), reaper_handle).await {
        warn!(error = %e, "Lease reaper did not shut down in time");
    }
    state.deployer().shutdown_rollouts(Duration::from_secs(10)).await;

    info!("Control plane shutdown complete");
    Ok(())
}
