use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::db::DbConfig;
use crate::deployer::DeployerConfig;
use crate::jobs::QueueConfig;
use crate::reaper::LeaseReaperConfig;

/// Which [`Store`](crate::db::Store) backs the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl std::str::FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "pg" => Ok(StoreBackend::Postgres),
            "memory" | "mem" => Ok(StoreBackend::Memory),
            other => bail!("unknown FLEET_STORE {other:?}, expected postgres or memory"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub dev_mode: bool,
    pub store: StoreBackend,
    pub database: DbConfig,
    pub agent_token: String,
    pub operator_token: String,
    pub deployer: DeployerConfig,
    pub queue: QueueConfig,
    pub reaper: LeaseReaperConfig,
}

/// Reads settings through `lookup`, so tests need not touch the process env.
struct Settings<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Settings<F> {
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
    }

    fn parse<T: std::str::FromStr>(&self, name: &str) -> Result<Option<T>>
    where
        T::Err: std::fmt::Display,
    {
        match self.raw(name) {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|e| anyhow::anyhow!("invalid {name}={raw:?}: {e}")),
            None => Ok(None),
        }
    }

    fn flag(&self, name: &str) -> Option<bool> {
        self.raw(name)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
    }

    /// A whole number of seconds that must not be zero.
    fn secs(&self, name: &str, default: Duration) -> Result<Duration> {
        match self.parse::<u64>(name)? {
            Some(0) => bail!("{name} must be greater than zero"),
            Some(secs) => Ok(Duration::from_secs(secs)),
            None => Ok(default),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Settings { lookup };

        let listen_addr = env
            .raw("FLEET_LISTEN_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8080".to_string())
            .parse()
            .context("invalid FLEET_LISTEN_ADDR")?;

        let log_level = env.raw("FLEET_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let dev_mode = env.flag("FLEET_DEV").unwrap_or(false);

        let store = env.parse("FLEET_STORE")?.unwrap_or(StoreBackend::Postgres);

        let defaults = DbConfig::default();
        let database = DbConfig {
            url: env.raw("DATABASE_URL").unwrap_or(defaults.url),
            pool_size: match env.parse::<u32>("FLEET_DB_POOL_SIZE")? {
                Some(0) => bail!("FLEET_DB_POOL_SIZE must be greater than zero"),
                Some(n) => n,
                None => defaults.pool_size,
            },
            acquire_timeout: defaults.acquire_timeout,
            migrate_on_start: env.flag("FLEET_DB_MIGRATE").unwrap_or(dev_mode),
            migrations_dir: env
                .raw("FLEET_MIGRATIONS_DIR")
                .map(Into::into)
                .unwrap_or(defaults.migrations_dir),
        };

        let (agent_token, operator_token) =
            match (env.raw("FLEET_AGENT_TOKEN"), env.raw("FLEET_OPERATOR_TOKEN")) {
                (Some(agent), Some(operator)) => (agent, operator),
                _ if dev_mode => ("dev-agent-token".to_string(), "dev-operator-token".to_string()),
                _ => bail!("FLEET_AGENT_TOKEN and FLEET_OPERATOR_TOKEN must be set"),
            };
        if agent_token == operator_token {
            bail!("FLEET_AGENT_TOKEN and FLEET_OPERATOR_TOKEN must differ");
        }

        let defaults = DeployerConfig::default();
        let deployer = DeployerConfig {
            base_image: env.raw("FLEET_BASE_IMAGE").unwrap_or(defaults.base_image),
            instance_prefix: env.raw("FLEET_INSTANCE_PREFIX").unwrap_or(defaults.instance_prefix),
            release_batch_size: match env.parse::<usize>("FLEET_RELEASE_BATCH_SIZE")? {
                Some(0) => bail!("FLEET_RELEASE_BATCH_SIZE must be greater than zero"),
                Some(n) => n,
                None => defaults.release_batch_size,
            },
            release_pause: env
                .parse::<u64>("FLEET_RELEASE_PAUSE_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.release_pause),
        };

        let defaults = QueueConfig::default();
        let queue = QueueConfig {
            lease: env.secs("FLEET_LEASE_SECS", defaults.lease)?,
            max_attempts: match env.parse::<u32>("FLEET_MAX_ATTEMPTS")? {
                Some(0) => bail!("FLEET_MAX_ATTEMPTS must be greater than zero"),
                Some(n) => n,
                None => defaults.max_attempts,
            },
            // 0 disables the cap.
            max_in_flight_per_tenant: match env.parse::<usize>("FLEET_MAX_IN_FLIGHT")? {
                Some(0) => None,
                Some(n) => Some(n),
                None => defaults.max_in_flight_per_tenant,
            },
        };

        let reaper = LeaseReaperConfig {
            interval: env.secs("FLEET_REAPER_INTERVAL_SECS", LeaseReaperConfig::default().interval)?,
        };

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            store,
            database,
            agent_token,
            operator_token,
            deployer,
            queue,
            reaper,
        })
    }
}
