//! fleetctl - operator CLI for the fleet control plane
//!
//! Provisions tenants, schedules rollouts and inspects the job queue through
//! the `Fleet::Deployer` service.

use anyhow::Result;
use clap::Parser;

mod client;
mod commands;
mod error;
mod output;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = cli.run().await {
        error::print_error(&e);
        std::process::exit(1);
    }

    Ok(())
}
