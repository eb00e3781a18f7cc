//! Fleet agent
//!
//! Long-lived process on each tenant host. Polls the control plane for jobs
//! and runs them locally.

use std::sync::Arc;

use anyhow::{Context, Result};
use fleet_agent::{
    artifact::{HttpArtifactSource, SignatureVerifier},
    client::HttpControlPlane,
    config::Config,
    host::SystemHost,
    identity::AgentIdentity,
    jobs::{ExecutorSettings, JobExecutor},
    runtime::Agent,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to FLEET_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let identity = AgentIdentity::detect();
    info!(
        agent_id = %identity.agent_id,
        hostname = %identity.hostname,
        local_ip = %identity.local_ip,
        tenant = %config.tenant_slug,
        control_url = %config.control_url,
        "Starting fleet agent"
    );

    let verifier = match &config.public_key {
        Some(key) => Some(SignatureVerifier::from_encoded(key).context("FLEET_PUBLIC_KEY")?),
        None => {
            warn!("FLEET_PUBLIC_KEY not set; deploy jobs will be refused");
            None
        }
    };

    let control = Arc::new(HttpControlPlane::new(
        &config.control_url,
        &config.token,
        config.step_timeout,
    )?);
    let executor = JobExecutor::new(
        ExecutorSettings::from_config(&config),
        Arc::new(HttpArtifactSource::new(config.step_timeout)?),
        Arc::new(SystemHost::new(&config)?),
        verifier,
    );

    let mut agent = Agent::new(
        identity,
        config.tenant_slug.clone(),
        config.poll_interval,
        "/".into(),
        control,
        executor,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut agent_handle = tokio::spawn(async move { agent.run(shutdown_rx).await });

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
        }
        result = &mut agent_handle => {
            match result {
                Ok(Ok(())) => info!("Agent loop exited"),
                Ok(Err(e)) => error!(error = %e, "Agent loop failed"),
                Err(e) => error!(error = %e, "Agent loop panicked"),
            }
            return Ok(());
        }
    }

    let _ = shutdown_tx.send(true);
    info!("Waiting for the current job to finish...");
    if let Err(e) = agent_handle.await {
        error!(error = %e, "Agent loop panicked during shutdown");
    }

    info!("Fleet agent shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
