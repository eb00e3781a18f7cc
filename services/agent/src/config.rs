//! Configuration for the agent.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Control plane base URL; the gatekeeper path is appended.
    pub control_url: String,

    /// Shared agent token sent as `X-Fleet-Token`.
    pub token: String,

    /// Tenant this host belongs to.
    pub tenant_slug: String,

    /// Scratch space: downloads and backups.
    pub work_dir: PathBuf,

    /// The live application tree.
    pub deploy_dir: PathBuf,

    pub poll_interval: Duration,

    /// Ed25519 public key of the release signer, hex or base64.
    pub public_key: Option<String>,

    pub restart_command: String,

    /// Run after extraction; failures are logged only.
    pub migrate_command: Option<String>,

    /// Local endpoint checked after a restart.
    pub smoke_url: String,
    pub smoke_attempts: u32,
    pub smoke_delay: Duration,

    /// Upper bound for every subprocess and HTTP call.
    pub step_timeout: Duration,

    /// Ceiling for `run_command` jobs; kept below the control plane's job lease.
    pub max_command_timeout: Duration,

    /// Backups kept under `<work_dir>/backups`. At least one.
    pub keep_backups: usize,

    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control_url: "http://127.0.0.1:8080".to_string(),
            token: String::new(),
            tenant_slug: String::new(),
            work_dir: PathBuf::from("/var/lib/fleet-agent"),
            deploy_dir: PathBuf::from("/srv/fleet"),
            poll_interval: Duration::from_secs(15),
            public_key: None,
            restart_command: "systemctl restart fleet.service".to_string(),
            migrate_command: None,
            smoke_url: "http://127.0.0.1:3000/fleet/gatekeeper".to_string(),
            smoke_attempts: 3,
            smoke_delay: Duration::from_secs(2),
            step_timeout: Duration::from_secs(60),
            max_command_timeout: Duration::from_secs(600),
            keep_backups: 5,
            log_level: "info".to_string(),
        }
    }
}

fn env_secs(name: &str, default: Duration) -> Result<Duration> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Duration::from_secs)
            .with_context(|| format!("invalid {name}={raw:?}")),
        Err(_) => Ok(default),
    }
}

fn env_number<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("invalid {name}={raw:?}")),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let token = std::env::var("FLEET_TOKEN").context("FLEET_TOKEN must be set")?;
        let tenant_slug =
            std::env::var("FLEET_TENANT_SLUG").context("FLEET_TENANT_SLUG must be set")?;

        let config = Self {
            control_url: std::env::var("FLEET_CONTROL_URL").unwrap_or(defaults.control_url),
            token,
            tenant_slug,
            work_dir: std::env::var("FLEET_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            deploy_dir: std::env::var("FLEET_DEPLOY_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.deploy_dir),
            poll_interval: env_secs("FLEET_POLL_INTERVAL", defaults.poll_interval)?,
            public_key: std::env::var("FLEET_PUBLIC_KEY").ok(),
            restart_command: std::env::var("FLEET_RESTART_COMMAND")
                .unwrap_or(defaults.restart_command),
            migrate_command: std::env::var("FLEET_MIGRATE_COMMAND").ok(),
            smoke_url: std::env::var("FLEET_SMOKE_URL").unwrap_or(defaults.smoke_url),
            smoke_attempts: env_number("FLEET_SMOKE_ATTEMPTS", defaults.smoke_attempts)?,
            smoke_delay: env_secs("FLEET_SMOKE_DELAY", defaults.smoke_delay)?,
            step_timeout: env_secs("FLEET_STEP_TIMEOUT", defaults.step_timeout)?,
            max_command_timeout: env_secs(
                "FLEET_MAX_COMMAND_TIMEOUT",
                defaults.max_command_timeout,
            )?,
            keep_backups: env_number("FLEET_KEEP_BACKUPS", defaults.keep_backups)?,
            log_level: std::env::var("FLEET_LOG_LEVEL").unwrap_or(defaults.log_level),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            bail!("FLEET_POLL_INTERVAL must be greater than zero");
        }
        if self.step_timeout.is_zero() {
            bail!("FLEET_STEP_TIMEOUT must be greater than zero");
        }
        if self.max_command_timeout.is_zero() {
            bail!("FLEET_MAX_COMMAND_TIMEOUT must be greater than zero");
        }
        // The newest backup is the rollback target of the deploy that made it.
        if self.keep_backups == 0 {
            bail!("FLEET_KEEP_BACKUPS must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.poll_interval, Duration::from_secs(15));
        assert_eq!(config.step_timeout, Duration::from_secs(60));
        assert_eq!(config.keep_backups, 5);
        assert_eq!(config.max_command_timeout, Duration::from_secs(600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let config = Config {
            poll_interval: Duration::ZERO,
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("FLEET_POLL_INTERVAL"));
    }

    #[test]
    fn test_zero_backups_rejected() {
        let config = Config {
            keep_backups: 0,
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("FLEET_KEEP_BACKUPS"));
    }
}
