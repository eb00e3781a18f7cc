//! Persistence for the control plane.
//!
//! This module provides:
//! - The [`Store`] trait every domain module is built on
//! - [`MemoryStore`] for dev mode and tests
//! - [`PgStore`] with runtime migrations, via [`Database`]

mod error;
mod memory;
mod postgres;
mod store;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{fields, to_fields, ClaimRequest, Condition, Fields, Filter, InFlightCap, Record, Store};

use std::path::PathBuf;
use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::migrate::Migrator;
use tracing::info;

/// Collection holding [`fleet_protocol::Tenant`] records.
pub const TENANTS: &str = "tenants";
/// Collection holding [`fleet_protocol::Job`] records.
pub const JOBS: &str = "jobs";
/// Collection holding [`fleet_protocol::TenantAgent`] snapshots.
pub const TENANT_AGENTS: &str = "tenant_agents";
/// Collection holding [`fleet_protocol::Rollout`] progress.
pub const ROLLOUTS: &str = "rollouts";

/// Connection settings for the Postgres store.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,

    /// Pooled connections. Each claim holds one for its whole transaction,
    /// so this bounds how many agents can poll at the same instant.
    pub pool_size: u32,

    pub acquire_timeout: Duration,

    /// Apply `migrations/` before serving. On by default in dev mode only;
    /// production schemas are migrated by the release pipeline.
    pub migrate_on_start: bool,

    pub migrations_dir: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/fleet".to_string(),
            pool_size: 5,
            acquire_timeout: Duration::from_secs(5),
            migrate_on_start: false,
            migrations_dir: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        }
    }
}

/// An open Postgres pool plus where its schema comes from.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    migrations_dir: PathBuf,
}

impl Database {
    /// Connects, then migrates when `migrate_on_start` is set.
    pub async fn open(config: &DbConfig) -> Result<Self, StoreError> {
        let db = Self::connect(config).await?;
        if config.migrate_on_start {
            db.run_migrations().await?;
        }
        Ok(db)
    }

    pub async fn connect(config: &DbConfig) -> Result<Self, StoreError> {
        info!(pool_size = config.pool_size, "Connecting to Postgres");

        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await?;

        Ok(Self {
            pool,
            migrations_dir: config.migrations_dir.clone(),
        })
    }

    /// Applies pending migrations from the configured directory.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        let dir = &self.migrations_dir;
        let migrator = Migrator::new(dir.clone()).await.map_err(|e| {
            StoreError::Migration(format!("cannot load migrations from {}: {e}", dir.display()))
        })?;
        migrator
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        info!(migrations_dir = %dir.display(), "Schema up to date");
        Ok(())
    }

    /// A [`Store`] over this pool.
    pub fn store(&self) -> PgStore {
        PgStore::new(self.pool.clone())
    }
}
