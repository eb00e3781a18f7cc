//! CLI commands.

mod jobs;
mod rollouts;
mod tenants;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::client::ApiClient;
use crate::output::OutputFormat;

/// fleetctl - provision tenants and roll out releases across the fleet.
#[derive(Debug, Parser)]
#[command(name = "fleetctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Control plane base URL.
    #[arg(
        long,
        global = true,
        env = "FLEET_CONTROL_URL",
        default_value = "http://127.0.0.1:8080"
    )]
    control_url: String,

    /// Operator token.
    #[arg(long, global = true, env = "FLEET_OPERATOR_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Output format (table or json).
    #[arg(long, global = true, default_value = "table")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manage tenants.
    Tenants(tenants::TenantsCommand),

    /// Schedule staged rollouts.
    Rollout(rollouts::RolloutCommand),

    /// Enqueue and inspect jobs.
    Jobs(jobs::JobsCommand),

    /// Show CLI version.
    Version,
}

impl Cli {
    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        let ctx = CommandContext {
            control_url: self.control_url,
            token: self.token,
            format: OutputFormat::parse(&self.format),
        };

        match self.command {
            Commands::Tenants(cmd) => cmd.run(ctx).await,
            Commands::Rollout(cmd) => cmd.run(ctx).await,
            Commands::Jobs(cmd) => cmd.run(ctx).await,
            Commands::Version => {
                println!("fleetctl {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub control_url: String,
    pub token: Option<String>,
    pub format: OutputFormat,
}

impl CommandContext {
    /// Get an authenticated API client.
    pub fn client(&self) -> Result<ApiClient> {
        let token = self.token.as_deref().ok_or_else(|| {
            anyhow::anyhow!("No operator token. Use --token or set FLEET_OPERATOR_TOKEN.")
        })?;
        ApiClient::new(&self.control_url, token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "fleetctl",
            "jobs",
            "list",
            "acme",
            "--format",
            "json",
            "--token",
            "op",
        ])
        .unwrap();
        assert_eq!(cli.format, "json");
        assert_eq!(cli.token.as_deref(), Some("op"));
    }

    #[test]
    fn test_missing_token() {
        let ctx = CommandContext {
            control_url: "http://127.0.0.1:8080".to_string(),
            token: None,
            format: OutputFormat::Table,
        };
        assert!(ctx.client().is_err());
    }
}
