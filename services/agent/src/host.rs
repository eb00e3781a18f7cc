//! Operations on the local service: shell commands, restart, migrations and
//! the post-deploy smoke check.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::Config;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to start command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("command timed out after {0:?}")]
    TimedOut(Duration),

    #[error("`{command}` exited with {exit_code:?}: {output}")]
    Failed {
        command: String,
        exit_code: Option<i32>,
        output: String,
    },

    #[error("smoke check failed: {0}")]
    Smoke(String),
}

/// Combined stdout and stderr of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub output: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// The service this agent deploys, as seen from the host.
#[async_trait]
pub trait ServiceHost: Send + Sync {
    /// Runs `command` under `sh -c` with stderr merged into stdout.
    async fn run_shell(&self, command: &str, timeout: Duration) -> Result<CommandOutput, HostError>;

    async fn restart_service(&self) -> Result<(), HostError>;

    /// Runs the migration command if one is configured.
    async fn run_migrations(&self) -> Result<(), HostError>;

    /// One smoke check of the freshly restarted service.
    async fn smoke_check(&self) -> Result<(), HostError>;
}

/// The real host: `sh`, the configured service manager and a local HTTP smoke check.
pub struct SystemHost {
    deploy_dir: PathBuf,
    restart_command: String,
    migrate_command: Option<String>,
    smoke_url: String,
    step_timeout: Duration,
    http: reqwest::Client,
}

impl SystemHost {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.step_timeout)
            .build()?;

        Ok(Self {
            deploy_dir: config.deploy_dir.clone(),
            restart_command: config.restart_command.clone(),
            migrate_command: config.migrate_command.clone(),
            smoke_url: config.smoke_url.clone(),
            step_timeout: config.step_timeout,
            http,
        })
    }

    async fn run_checked(&self, command: &str, dir: Option<&PathBuf>) -> Result<(), HostError> {
        let output = spawn_shell(command, dir, self.step_timeout).await?;
        if !output.success() {
            return Err(HostError::Failed {
                command: command.to_string(),
                exit_code: output.exit_code,
                output: output.output,
            });
        }
        Ok(())
    }
}

pub(crate) async fn spawn_shell(
    command: &str,
    dir: Option<&PathBuf>,
    timeout: Duration,
) -> Result<CommandOutput, HostError> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(format!("exec 2>&1\n{command}"))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    if let Some(dir) = dir.filter(|d| d.is_dir()) {
        cmd.current_dir(dir);
    }

    let child = cmd.spawn()?;
    // Dropping the future on timeout kills the child.
    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| HostError::TimedOut(timeout))??;

    Ok(CommandOutput {
        output: String::from_utf8_lossy(&output.stdout).into_owned(),
        exit_code: output.status.code(),
    })
}

#[async_trait]
impl ServiceHost for SystemHost {
    async fn run_shell(&self, command: &str, timeout: Duration) -> Result<CommandOutput, HostError> {
        debug!(command, ?timeout, "Running shell command");
        spawn_shell(command, None, timeout).await
    }

    async fn restart_service(&self) -> Result<(), HostError> {
        info!(command = %self.restart_command, "Restarting service");
        self.run_checked(&self.restart_command, None).await
    }

    async fn run_migrations(&self) -> Result<(), HostError> {
        let Some(command) = &self.migrate_command else {
            return Ok(());
        };
        info!(command = %command, "Running migrations");
        self.run_checked(command, Some(&self.deploy_dir)).await
    }

    async fn smoke_check(&self) -> Result<(), HostError> {
        let body = json!({
            "service": "Health::Main",
            "action": "ping",
            "payload": {},
        });

        let response = self
            .http
            .post(&self.smoke_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| HostError::Smoke(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(HostError::Smoke(format!("{} returned {status}", self.smoke_url)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stderr_is_merged() {
        let out = spawn_shell("echo out; echo err 1>&2; exit 3", None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.output, "out\nerr\n");
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_timeout() {
        let err = spawn_shell("sleep 5", None, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::TimedOut(_)));
    }

    #[tokio::test]
    async fn test_missing_migrate_command_is_a_no_op() {
        let host = SystemHost::new(&Config::default()).unwrap();
        host.run_migrations().await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_restart() {
        let config = Config {
            restart_command: "echo nope; exit 1".to_string(),
            ..Config::default()
        };
        let host = SystemHost::new(&config).unwrap();
        let err = host.restart_service().await.unwrap_err();
        assert!(matches!(err, HostError::Failed { exit_code: Some(1), .. }));
    }
}
