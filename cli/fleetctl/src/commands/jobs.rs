//! Job commands.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use fleet_protocol::{
    DeployerAction, EnqueueJobRequest, Job, JobStatus, ListJobsRequest, ListJobsResponse,
};
use serde::Serialize;
use serde_json::Value;
use tabled::Tabled;

use crate::output::{display_option, print_output, print_success, OutputFormat};

use super::CommandContext;

/// Job commands.
#[derive(Debug, Args)]
pub struct JobsCommand {
    #[command(subcommand)]
    command: JobsSubcommand,
}

#[derive(Debug, Subcommand)]
enum JobsSubcommand {
    /// Queue a job for a tenant.
    Enqueue(EnqueueArgs),

    /// List a tenant's jobs.
    List(ListArgs),
}

#[derive(Debug, Args)]
struct EnqueueArgs {
    /// Tenant slug.
    tenant: String,

    /// Job type (deploy_bundle or run_command).
    #[arg(long = "type")]
    job_type: String,

    /// Job payload as a JSON object.
    #[arg(long, default_value = "{}")]
    payload: String,
}

#[derive(Debug, Args)]
struct ListArgs {
    /// Tenant slug.
    tenant: String,

    /// Only jobs with this status (pending, claimed, complete, failed).
    #[arg(long)]
    status: Option<String>,
}

impl JobsCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            JobsSubcommand::Enqueue(args) => enqueue(ctx, args).await,
            JobsSubcommand::List(args) => list(ctx, args).await,
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
struct JobRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Type")]
    job_type: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Claimed By", display = "display_option")]
    claimed_by: Option<String>,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Error", display = "display_option")]
    error: Option<String>,
    #[tabled(rename = "Created")]
    created_at: String,
}

impl From<&Job> for JobRow {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.to_string(),
            job_type: job.job_type.to_string(),
            status: job.status.to_string(),
            claimed_by: job.claimed_by.clone(),
            attempts: job.attempts,
            error: job.error().map(str::to_string),
            created_at: job.created_at.to_rfc3339(),
        }
    }
}

fn parse_status(raw: &str) -> Result<JobStatus> {
    serde_json::from_value(Value::String(raw.to_string()))
        .with_context(|| format!("Unknown job status '{raw}'"))
}

async fn enqueue(ctx: CommandContext, args: EnqueueArgs) -> Result<()> {
    let payload: Value =
        serde_json::from_str(&args.payload).context("--payload must be valid JSON")?;
    let client = ctx.client()?;

    let job: Job = client
        .call(DeployerAction::EnqueueJob(EnqueueJobRequest {
            tenant_slug: args.tenant,
            job_type: args.job_type,
            payload,
        }))
        .await?;

    if ctx.format == OutputFormat::Table {
        print_success(&format!("Enqueued {} job {}", job.job_type, job.id));
    }
    print_output(&[JobRow::from(&job)], ctx.format);
    Ok(())
}

async fn list(ctx: CommandContext, args: ListArgs) -> Result<()> {
    let status = args.status.as_deref().map(parse_status).transpose()?;
    let client = ctx.client()?;

    let response: ListJobsResponse = client
        .call(DeployerAction::ListJobs(ListJobsRequest {
            tenant_slug: args.tenant,
            status,
        }))
        .await?;

    let rows: Vec<JobRow> = response.jobs.iter().map(JobRow::from).collect();
    print_output(&rows, ctx.format);
    Ok(())
}
