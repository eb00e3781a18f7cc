//! Tenant commands.

use anyhow::Result;
use clap::{Args, Subcommand};
use fleet_protocol::{DeployerAction, ProvisionTenantRequest, RebootTenantRequest, Tenant};
use serde::Serialize;
use tabled::Tabled;

use crate::output::{print_output, print_success, OutputFormat};

use super::CommandContext;

/// Tenant commands.
#[derive(Debug, Args)]
pub struct TenantsCommand {
    #[command(subcommand)]
    command: TenantsSubcommand,
}

#[derive(Debug, Subcommand)]
enum TenantsSubcommand {
    /// Create an instance and register a tenant on it.
    Provision(ProvisionArgs),

    /// Reboot a tenant's instance.
    Reboot {
        /// Tenant slug.
        slug: String,
    },
}

#[derive(Debug, Args)]
struct ProvisionArgs {
    /// Tenant slug (lowercase letters, digits and dashes).
    slug: String,

    /// Plan, used as the instance flavor.
    #[arg(long, default_value = "standard")]
    plan: String,

    /// SSH public key to install; repeatable.
    #[arg(long = "ssh-key")]
    ssh_keys: Vec<String>,
}

impl TenantsCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            TenantsSubcommand::Provision(args) => provision(ctx, args).await,
            TenantsSubcommand::Reboot { slug } => reboot(ctx, slug).await,
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
struct TenantRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Slug")]
    slug: String,
    #[tabled(rename = "IP")]
    ip: String,
    #[tabled(rename = "Instance")]
    provider_instance_id: String,
    #[tabled(rename = "Plan")]
    plan: String,
    #[tabled(rename = "Created")]
    created_at: String,
}

impl From<&Tenant> for TenantRow {
    fn from(t: &Tenant) -> Self {
        Self {
            id: t.id.to_string(),
            slug: t.slug.clone(),
            ip: t.ip.clone(),
            provider_instance_id: t.provider_instance_id.clone(),
            plan: t.plan.clone(),
            created_at: t.created_at.to_rfc3339(),
        }
    }
}

async fn provision(ctx: CommandContext, args: ProvisionArgs) -> Result<()> {
    let client = ctx.client()?;

    let tenant: Tenant = client
        .call(DeployerAction::ProvisionTenant(ProvisionTenantRequest {
            slug: args.slug,
            plan: args.plan,
            ssh_keys: args.ssh_keys,
        }))
        .await?;

    if ctx.format == OutputFormat::Table {
        print_success(&format!("Provisioned tenant '{}' at {}", tenant.slug, tenant.ip));
    }
    print_output(&[TenantRow::from(&tenant)], ctx.format);
    Ok(())
}

async fn reboot(ctx: CommandContext, slug: String) -> Result<()> {
    let client = ctx.client()?;
    let tenant: Tenant = client
        .call(DeployerAction::RebootTenant(RebootTenantRequest { slug }))
        .await?;

    if ctx.format == OutputFormat::Table {
        print_success(&format!("Rebooting tenant '{}' ({})", tenant.slug, tenant.provider_instance_id));
    }
    print_output(&[TenantRow::from(&tenant)], ctx.format);
    Ok(())
}
