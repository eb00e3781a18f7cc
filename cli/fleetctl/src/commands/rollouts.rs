//! Rollout commands.

use anyhow::Result;
use clap::{Args, Subcommand};
use fleet_id::RolloutId;
use fleet_protocol::{
    DeployerAction, GetRolloutRequest, Rollout, ScheduleRolloutRequest, ScheduleRolloutResponse,
};
use serde::Serialize;
use tabled::Tabled;

use crate::output::{print_info, print_output, print_single, print_success, OutputFormat};

use super::CommandContext;

/// Rollout commands.
#[derive(Debug, Args)]
pub struct RolloutCommand {
    #[command(subcommand)]
    command: RolloutSubcommand,
}

#[derive(Debug, Subcommand)]
enum RolloutSubcommand {
    /// Queue a signed bundle for deployment to tenants, batch by batch.
    Schedule(ScheduleArgs),

    /// Show how far a rollout got.
    Status {
        /// Rollout ID (rol_...).
        rollout_id: RolloutId,
    },
}

#[derive(Debug, Args)]
struct ScheduleArgs {
    /// URL of the release tarball.
    #[arg(long)]
    artifact: String,

    /// URL of the tarball's Ed25519 signature.
    #[arg(long)]
    signature: String,

    /// Tenant slugs, comma separated.
    #[arg(long, value_delimiter = ',', required = true)]
    tenants: Vec<String>,

    /// Tenants per batch.
    #[arg(long, default_value = "10")]
    batch_size: usize,

    /// Seconds to wait between batches.
    #[arg(long, default_value = "600")]
    pause_secs: u64,

    /// Keep going after a failed deploy.
    #[arg(long)]
    no_halt: bool,

    /// Release tag, recorded with the rollout.
    #[arg(long)]
    tag: Option<String>,
}

impl RolloutCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            RolloutSubcommand::Schedule(args) => schedule(ctx, args).await,
            RolloutSubcommand::Status { rollout_id } => status(ctx, rollout_id).await,
        }
    }
}

async fn schedule(ctx: CommandContext, args: ScheduleArgs) -> Result<()> {
    let client = ctx.client()?;
    let tenant_count = args.tenants.len();

    let response: ScheduleRolloutResponse = client
        .call(DeployerAction::ScheduleRollout(ScheduleRolloutRequest {
            artifact_url: args.artifact,
            signature_url: args.signature,
            tenants: args.tenants,
            batch_size: args.batch_size,
            pause_secs: args.pause_secs,
            halt_on_failure: !args.no_halt,
            tag: args.tag,
        }))
        .await?;

    match ctx.format {
        OutputFormat::Table => {
            print_success(&format!(
                "Scheduled rollout {} for {} tenant(s)",
                response.rollout_id, response.count
            ));
            let batches = tenant_count.div_ceil(args.batch_size.max(1));
            if batches > 1 {
                print_info(&format!(
                    "{batches} batches, {}s apart; track progress with `fleetctl rollout status {}`",
                    args.pause_secs, response.rollout_id
                ));
            }
        }
        OutputFormat::Json => print_single(&response),
    }
    Ok(())
}

#[derive(Debug, Serialize, Tabled)]
struct RolloutRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Tag")]
    tag: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Created")]
    created: usize,
    #[tabled(rename = "Remaining")]
    remaining: usize,
    #[tabled(rename = "Batches")]
    batches: usize,
    #[tabled(rename = "Updated")]
    updated_at: String,
}

impl From<&Rollout> for RolloutRow {
    fn from(r: &Rollout) -> Self {
        Self {
            id: r.id.to_string(),
            tag: r.tag.clone().unwrap_or_else(|| "-".to_string()),
            status: r.status.to_string(),
            created: r.created,
            remaining: r.remaining(),
            batches: r.batches,
            updated_at: r.updated_at.to_rfc3339(),
        }
    }
}

async fn status(ctx: CommandContext, rollout_id: RolloutId) -> Result<()> {
    let client = ctx.client()?;
    let rollout: Rollout = client
        .call(DeployerAction::GetRollout(GetRolloutRequest { rollout_id }))
        .await?;

    match ctx.format {
        OutputFormat::Table => print_output(&[RolloutRow::from(&rollout)], ctx.format),
        OutputFormat::Json => print_single(&rollout),
    }
    Ok(())
}
